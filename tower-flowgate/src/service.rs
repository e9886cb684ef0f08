use std::future::Future;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use flowgate::BlockError;
use flowgate::Entry;
use flowgate::FlowGate;
use flowgate::ResourceType;
use flowgate::TrafficType;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;
use tracing::debug;

use crate::error::GateError;
use crate::layer::ResourceExtractor;

#[derive(Clone, Debug)]
struct FlowGateServiceMetrics {
    waited: Counter<u64>,
}

/// Enters a flowgate resource for every request and exits it when the
/// response is ready.
///
/// A blocked request fails with [`GateError::Blocked`] without reaching the
/// inner service. A paced request is held on a tokio timer before the inner
/// future is first polled.
#[derive(Clone, Debug)]
pub struct FlowGateService<S, R> {
    inner: S,
    gate: FlowGate,
    extractor: R,
    resource_type: ResourceType,
    instruments: FlowGateServiceMetrics,
}

pin_project! {
    /// Response future of [`FlowGateService`].
    pub struct ResponseFuture<F> {
        #[pin]
        kind: Kind<F>,
    }
}

pin_project! {
    #[project = KindProj]
    enum Kind<F> {
        Blocked {
            error: Option<BlockError>,
        },
        Admitted {
            #[pin]
            delay: Option<Sleep>,
            #[pin]
            inner: F,
            entry: Option<Entry>,
        },
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: Into<BoxError>,
{
    type Output = Result<T, GateError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            KindProj::Blocked { error } => match error.take() {
                Some(err) => Poll::Ready(Err(GateError::Blocked(err))),
                None => panic!("ResponseFuture polled after completion"),
            },
            KindProj::Admitted {
                mut delay,
                inner,
                entry,
            } => {
                if let Some(timer) = delay.as_mut().as_pin_mut() {
                    ready!(timer.poll(cx));
                }
                delay.set(None);

                let res = ready!(inner.poll(cx));
                let mut entry = entry.take();
                let res = res.map_err(|err| {
                    let err: BoxError = err.into();
                    if let Some(entry) = entry.as_mut() {
                        entry.set_error(err.to_string());
                    }
                    GateError::Inner(err)
                });
                if let Some(entry) = entry {
                    entry.exit();
                }
                Poll::Ready(res)
            }
        }
    }
}

impl<S, R, Req> Service<Req> for FlowGateService<S, R>
where
    S: Service<Req>,
    S::Error: Into<BoxError>,
    R: ResourceExtractor<Req>,
{
    type Response = S::Response;
    type Error = GateError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner
            .poll_ready(cx)
            .map_err(|err| GateError::Inner(err.into()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let resource = self.extractor.extract(&req);
        let admitted = self
            .gate
            .entry(resource.as_str())
            .with_resource_type(self.resource_type)
            .with_traffic_type(TrafficType::Inbound)
            .try_enter();

        let kind = match admitted {
            Err(err) => {
                debug!(%resource, %err, "request blocked");
                Kind::Blocked { error: Some(err) }
            }
            Ok((entry, wait)) => {
                let delay = if wait.is_zero() {
                    None
                } else {
                    self.instruments
                        .waited
                        .add(1, &[KeyValue::new("resource", resource)]);
                    Some(sleep(wait))
                };
                Kind::Admitted {
                    delay,
                    inner: self.inner.call(req),
                    entry: Some(entry),
                }
            }
        };
        ResponseFuture { kind }
    }
}

impl<S, R> FlowGateService<S, R> {
    pub fn new(inner: S, gate: FlowGate, extractor: R) -> Self {
        let meter = global::meter("flowgate");
        let instruments = FlowGateServiceMetrics {
            waited: meter
                .u64_counter("flowgate_tower_waited_total")
                .with_description("Requests held back by a pacing rule")
                .build(),
        };

        Self {
            inner,
            gate,
            extractor,
            resource_type: ResourceType::Web,
            instruments,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}
