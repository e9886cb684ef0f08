use std::fmt;
use std::sync::Arc;

use flowgate::FlowGate;
use flowgate::ResourceType;
use tower::Layer;

use crate::service::FlowGateService;

/// Names the flowgate resource a request enters.
pub trait ResourceExtractor<Req> {
    fn extract(&self, req: &Req) -> String;
}

/// Every request enters the same resource.
#[derive(Clone, Debug)]
pub struct FixedResource(Arc<str>);

impl<Req> ResourceExtractor<Req> for FixedResource {
    fn extract(&self, _req: &Req) -> String {
        self.0.to_string()
    }
}

impl<Req, F> ResourceExtractor<Req> for F
where
    F: Fn(&Req) -> String,
{
    fn extract(&self, req: &Req) -> String {
        self(req)
    }
}

/// Guards requests with a [`FlowGate`] entry.
#[derive(Clone)]
pub struct FlowGateLayer<R = FixedResource> {
    gate: FlowGate,
    extractor: R,
    resource_type: ResourceType,
}

impl<R> fmt::Debug for FlowGateLayer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowGateLayer")
            .field("gate", &self.gate)
            .field("resource_type", &self.resource_type)
            .finish_non_exhaustive()
    }
}

impl FlowGateLayer {
    /// Create a FlowGateLayer where every request enters `resource`.
    pub fn new(gate: FlowGate, resource: impl Into<String>) -> Self {
        let resource: String = resource.into();
        Self::with_extractor(gate, FixedResource(resource.into()))
    }
}

impl<R> FlowGateLayer<R> {
    /// Create a FlowGateLayer that names the resource from each request,
    /// e.g. `|req: &Request<B>| req.uri().path().to_string()`.
    pub fn with_extractor(gate: FlowGate, extractor: R) -> Self {
        FlowGateLayer {
            gate,
            extractor,
            resource_type: ResourceType::Web,
        }
    }

    /// Set the classification of the guarded resources. Defaults to `Web`.
    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }
}

impl<R, S> Layer<S> for FlowGateLayer<R>
where
    R: Clone,
{
    type Service = FlowGateService<S, R>;

    fn layer(&self, service: S) -> Self::Service {
        FlowGateService::new(service, self.gate.clone(), self.extractor.clone())
            .with_resource_type(self.resource_type)
    }
}
