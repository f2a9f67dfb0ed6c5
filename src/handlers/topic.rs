//! Topics on the development broker.

use async_trait::async_trait;
use tracing::debug;

use crate::provisioner::{HandlerContext, HandlerError, ResourceHandler};
use crate::schema::{Provisioned, RuntimeEvent, TopicRuntimeEvent};
use crate::utils::naming::topic_id;

/// Assigns broker topic ids; the development broker creates topics on first use.
pub struct TopicHandler {
    brokers: Vec<String>,
}

impl TopicHandler {
    pub fn new(brokers: Vec<String>) -> Self {
        Self { brokers }
    }
}

#[async_trait]
impl ResourceHandler for TopicHandler {
    async fn provision(
        &self,
        ctx: &HandlerContext,
        resource: &Provisioned,
        _previous: Option<&Provisioned>,
    ) -> Result<Option<RuntimeEvent>, HandlerError> {
        let topic_id = topic_id(ctx.module_name(), &resource.resource_id);
        debug!(module = %ctx.module_name(), topic_id = %topic_id, "Assigned topic");
        Ok(Some(RuntimeEvent::Topic(TopicRuntimeEvent {
            id: resource.resource_id.clone(),
            topic_id,
            brokers: self.brokers.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{get_provisioned, Module, Type};
    use crate::test_utils::{handler_context, topic_decl};

    #[tokio::test]
    async fn test_topic_event() {
        let module = Module::new("orders").with_decl(topic_decl("created", Type::Unit));
        let resource = get_provisioned(&module).remove("created").unwrap();
        let handler = TopicHandler::new(vec!["127.0.0.1:19092".to_string()]);

        let event = handler
            .provision(&handler_context(module), &resource, None)
            .await
            .unwrap();

        assert_eq!(
            event,
            Some(RuntimeEvent::Topic(TopicRuntimeEvent {
                id: "created".to_string(),
                topic_id: "orders.created".to_string(),
                brokers: vec!["127.0.0.1:19092".to_string()],
            }))
        );
    }
}
