use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{ConfigError, SubscribeError};
use crate::kafka::batch_message::Batch;
use crate::kafka::message::Message;
use crate::kafka::offset_resolver::{
    OffsetAssignmentListener, OffsetResolver, DEFAULT_OFFSET_QUERY_TIMEOUT,
};
use crate::kafka::transport::TransportFactory;
use crate::pipelines::{
    compile, Action, ErrorInterceptor, FieldSelector, Handler, PipelineContext,
};
use crate::policy::{parse_inline, PolicySet};
use crate::subscription::{PayloadDecoder, Subscription};

/// Named handlers that inline configurations refer to with `=> name`, and the
/// field selectors their `parallel(<field>, N)` policies group by.
///
/// Lives as long as the manager that owns it; nothing here is process-global.
/// Names are case-insensitive. Field selectors are kept per payload type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>,
    fields: RwLock<HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a per-message handler for payloads decoded as `T`.
    pub fn register_message<T: Send + Sync + 'static>(
        &self,
        name: &str,
        handler: Arc<dyn Handler<Message<T>>>,
    ) {
        self.insert(name, Action::PerMessage(handler));
    }

    /// Register a per-batch handler for payloads decoded as `T`.
    pub fn register_batch<T: Send + Sync + 'static>(
        &self,
        name: &str,
        handler: Arc<dyn Handler<Batch<T>>>,
    ) {
        self.insert(name, Action::PerBatch(handler));
    }

    fn insert<T: Send + Sync + 'static>(&self, name: &str, action: Action<T>) {
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase(), Box::new(action));
        if previous.is_some() {
            warn!(handler = name, "Replaced previously registered handler");
        }
    }

    /// The action registered under `name`, for payload type `T`.
    pub fn action<T: Send + Sync + 'static>(&self, name: &str) -> Result<Action<T>, ConfigError> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = handlers
            .get(&name.to_lowercase())
            .ok_or_else(|| ConfigError::UnknownHandler(name.to_string()))?;
        entry
            .downcast_ref::<Action<T>>()
            .cloned()
            .ok_or_else(|| {
                ConfigError::HandlerMismatch(format!(
                    "handler {name} does not take payloads of type {}",
                    type_name::<T>()
                ))
            })
    }

    /// Register a group-by field selector for payloads decoded as `T`.
    pub fn register_field<T: Send + Sync + 'static>(
        &self,
        name: &str,
        selector: FieldSelector<T>,
    ) {
        let previous = self
            .fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((TypeId::of::<T>(), name.to_lowercase()), Box::new(selector));
        if previous.is_some() {
            warn!(field = name, "Replaced previously registered field selector");
        }
    }

    /// Every field selector registered for payload type `T`.
    pub fn fields<T: Send + Sync + 'static>(&self) -> Vec<(String, FieldSelector<T>)> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((type_id, _), _)| *type_id == TypeId::of::<T>())
            .filter_map(|((_, name), selector)| {
                selector
                    .downcast_ref::<FieldSelector<T>>()
                    .map(|selector| (name.clone(), selector.clone()))
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.to_lowercase())
    }
}

/// Everything needed to start one subscription.
pub struct SubscriptionRequest<T> {
    pub topic: String,
    pub policies: PolicySet,
    pub action: Action<T>,
    pub decoder: Arc<dyn PayloadDecoder<T>>,
    pub interceptor: Option<Arc<dyn ErrorInterceptor>>,
    pub fields: HashMap<String, FieldSelector<T>>,
}

impl<T> SubscriptionRequest<T> {
    pub fn new(
        topic: impl Into<String>,
        policies: PolicySet,
        action: Action<T>,
        decoder: Arc<dyn PayloadDecoder<T>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            policies,
            action,
            decoder,
            interceptor: None,
            fields: HashMap::new(),
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ErrorInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    /// Selector used by `parallel(<name>)` grouping.
    pub fn with_field(mut self, name: impl Into<String>, selector: FieldSelector<T>) -> Self {
        self.fields.insert(name.into(), selector);
        self
    }
}

/// Creates subscriptions and keeps track of the running ones.
pub struct SubscriptionManager {
    factory: Arc<dyn TransportFactory>,
    registry: HandlerRegistry,
    query_timeout: Duration,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SubscriptionManager {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            registry: HandlerRegistry::new(),
            query_timeout: DEFAULT_OFFSET_QUERY_TIMEOUT,
            subscriptions: Mutex::new(vec![]),
        }
    }

    /// Timeout for topic lookups and the offset queries run at assignment.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Subscriptions that have not finished yet.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.retain(Subscription::is_running);
        subscriptions.clone()
    }

    /// Validate the request, build its pipeline and start consuming.
    ///
    /// Returns `Ok(None)` when a State policy disables the handler; no transport
    /// is created in that case. Every configuration fault is reported here.
    pub async fn subscribe<T: Send + Sync + 'static>(
        &self,
        request: SubscriptionRequest<T>,
    ) -> Result<Option<Subscription>, SubscribeError> {
        let SubscriptionRequest {
            topic,
            policies,
            action,
            decoder,
            interceptor,
            fields,
        } = request;

        policies.validate()?;
        if !policies.is_enabled() {
            info!(topic = %topic, "Handler disabled by state policy - not subscribing");
            return Ok(None);
        }

        let transport = self.factory.create()?;
        match transport.topic_exists(&topic, self.query_timeout) {
            Ok(true) => {}
            Ok(false) => {
                transport.close();
                return Err(ConfigError::UnknownTopic(topic).into());
            }
            Err(e) => {
                transport.close();
                return Err(e.into());
            }
        }

        let cancel = CancellationToken::new();
        let mut context = PipelineContext::new(cancel.clone());
        if let Some(interceptor) = interceptor {
            context = context.with_interceptor(interceptor);
        }
        for (name, selector) in fields {
            context = context.with_field(name, selector);
        }

        let pipeline = match compile(&policies, action, context) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => {
                transport.close();
                return Ok(None);
            }
            Err(e) => {
                transport.close();
                return Err(e.into());
            }
        };

        let resolver = policies
            .offset()
            .map(|policy| OffsetResolver::new(policy.clone(), self.query_timeout));
        let listener = Arc::new(OffsetAssignmentListener::new(resolver));
        if let Err(e) = transport.subscribe(&topic, listener) {
            error!(topic = %topic, error = ?e, "Transport failed to subscribe");
            cancel.cancel();
            pipeline.head().complete();
            transport.close();
            return Err(e.into());
        }

        info!(
            topic = %topic,
            stages = ?pipeline.stages(),
            "Subscribed"
        );
        let subscription = Subscription::start(
            topic,
            transport,
            decoder,
            pipeline,
            cancel,
            self.query_timeout,
        );
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription.clone());
        Ok(Some(subscription))
    }

    /// Subscribe from an inline configuration such as
    /// `topic: orders, batch(100, 500), retry(3, 200), commit() => orders`.
    /// The topic is required, and so is the handler, which must be registered.
    /// Field selectors registered for `T` are available to `parallel(<field>)`.
    pub async fn subscribe_inline<T: Send + Sync + 'static>(
        &self,
        config: &str,
        decoder: Arc<dyn PayloadDecoder<T>>,
    ) -> Result<Option<Subscription>, SubscribeError> {
        let inline = parse_inline(config)?;
        let topic = inline.topic.ok_or(ConfigError::MissingProperty("topic"))?;
        let handler = inline
            .handler
            .ok_or(ConfigError::MissingProperty("handler"))?;
        let action = self.registry.action::<T>(&handler)?;

        let mut request = SubscriptionRequest::new(topic, inline.policies, action, decoder);
        for (name, selector) in self.registry.fields::<T>() {
            request = request.with_field(name, selector);
        }
        self.subscribe(request).await
    }

    /// Unsubscribe everything concurrently, each with `timeout`. Returns false if
    /// any subscription failed to drain in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let subscriptions: Vec<Subscription> = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        info!(count = subscriptions.len(), "Shutting down subscriptions");

        let results = join_all(subscriptions.iter().map(|s| s.unsubscribe(timeout))).await;
        results.into_iter().all(|drained| drained)
    }
}
