use std::any::Any;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::base::BlockError;
use crate::base::EntryContext;
use crate::base::ResultStatus;
use crate::base::TokenResult;

/// Common behaviour of every slot: its position within its stage.
pub trait BaseSlot: Send + Sync {
    /// Slots of a stage run in ascending order; ties keep insertion order.
    fn order(&self) -> u32;
}

/// Runs before any rule is checked, typically to attach statistics.
pub trait StatPrepareSlot: BaseSlot {
    fn prepare(&self, ctx: &mut EntryContext);
}

/// Decides whether the call may pass.
pub trait RuleCheckSlot: BaseSlot {
    /// Called once when the slot is added to a chain.
    fn initial(&self) {}

    /// `None` means the slot has nothing to say about this call.
    fn check(&self, ctx: &mut EntryContext) -> Option<TokenResult>;
}

/// Runs after the rule checks of a passing call and may annotate or block it.
pub trait RouterSlot: BaseSlot {
    fn route(&self, ctx: &mut EntryContext) -> Option<TokenResult>;
}

/// Records the outcome of a call.
pub trait StatSlot: BaseSlot {
    fn on_entry_passed(&self, ctx: &EntryContext);
    fn on_entry_blocked(&self, ctx: &EntryContext, err: &BlockError);
    /// Only called for calls that were not blocked.
    fn on_completed(&self, ctx: &EntryContext);
}

/// The fixed four stage pipeline every call goes through.
#[derive(Default)]
pub struct SlotChain {
    stat_pres: Vec<Arc<dyn StatPrepareSlot>>,
    rule_checks: Vec<Arc<dyn RuleCheckSlot>>,
    routers: Vec<Arc<dyn RouterSlot>>,
    stats: Vec<Arc<dyn StatSlot>>,
}

impl std::fmt::Debug for SlotChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotChain")
            .field("stat_pres", &self.stat_pres.len())
            .field("rule_checks", &self.rule_checks.len())
            .field("routers", &self.routers.len())
            .field("stats", &self.stats.len())
            .finish()
    }
}

fn insert_sorted<T: ?Sized + BaseSlot>(slots: &mut Vec<Arc<T>>, slot: Arc<T>) {
    slots.push(slot);
    slots.sort_by_key(|s| s.order());
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl SlotChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stat_prepare_slot(&mut self, slot: Arc<dyn StatPrepareSlot>) {
        insert_sorted(&mut self.stat_pres, slot);
    }

    pub fn add_rule_check_slot(&mut self, slot: Arc<dyn RuleCheckSlot>) {
        slot.initial();
        insert_sorted(&mut self.rule_checks, slot);
    }

    pub fn add_router_slot(&mut self, slot: Arc<dyn RouterSlot>) {
        insert_sorted(&mut self.routers, slot);
    }

    pub fn add_stat_slot(&mut self, slot: Arc<dyn StatSlot>) {
        insert_sorted(&mut self.stats, slot);
    }

    /// Runs the four stages for `ctx` and returns the final verdict.
    ///
    /// A panic inside any slot is caught here, stored as the context error and
    /// reported as a [`ResultStatus::Fail`] result.
    pub fn entry(&self, ctx: &mut EntryContext) -> TokenResult {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run(ctx)));
        if let Err(payload) = outcome {
            let msg = panic_message(payload.as_ref());
            tracing::error!(resource = ctx.resource_name(), panic = %msg, "slot chain panicked");
            ctx.set_error(format!("slot chain panicked: {msg}").into());
            *ctx.rule_check_result_mut() = TokenResult::fail();
        }
        ctx.rule_check_result().clone()
    }

    fn run(&self, ctx: &mut EntryContext) {
        for slot in &self.stat_pres {
            slot.prepare(ctx);
        }

        let mut blocked = None;
        for slot in &self.rule_checks {
            if let Some(result) = slot.check(ctx)
                && result.is_blocked()
            {
                blocked = Some(result);
                break;
            }
        }
        match blocked {
            Some(result) => *ctx.rule_check_result_mut() = result,
            None => ctx.rule_check_result_mut().reset_to_pass(),
        }

        if !ctx.is_blocked() {
            for slot in &self.routers {
                if let Some(result) = slot.route(ctx)
                    && let Some(err) = result.block_error()
                {
                    ctx.rule_check_result_mut().reset_to_blocked(err.clone());
                    break;
                }
            }
        }

        let resource = ctx.resource_name().to_string();
        if let Some(err) = ctx.rule_check_result_mut().block_error_mut() {
            err.set_resource(&resource);
        }

        match ctx.rule_check_result().block_error().cloned() {
            Some(err) => {
                for slot in &self.stats {
                    slot.on_entry_blocked(ctx, &err);
                }
            }
            None => {
                for slot in &self.stats {
                    slot.on_entry_passed(ctx);
                }
            }
        }
    }

    /// Runs the completion hooks. Blocked and failed calls did no work and
    /// are skipped.
    pub fn exit(&self, ctx: &mut EntryContext) {
        match ctx.rule_check_result().status() {
            ResultStatus::Blocked | ResultStatus::Fail => return,
            ResultStatus::Pass | ResultStatus::ShouldWait => {}
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            for slot in &self.stats {
                slot.on_completed(ctx);
            }
        }));
        if let Err(payload) = outcome {
            let msg = panic_message(payload.as_ref());
            tracing::error!(resource = ctx.resource_name(), panic = %msg, "slot chain panicked on exit");
        }
    }
}
