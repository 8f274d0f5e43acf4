use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{Bus, BusMessage};
use crate::db::models::{Channel, Notification, Template, User};

use super::{Provider, ProviderError, ProviderErrorKind, ProviderSendResult, SendContext};

/// Publishes to the pub/sub bus rather than delivering directly; the SSE
/// broadcaster (crate::routes::sse) fans the message out to open streams.
pub struct SseProvider {
    bus: Arc<Bus>,
}

impl SseProvider {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Provider for SseProvider {
    async fn send(
        &self,
        _ctx: &SendContext,
        notification: &Notification,
        user: &User,
        _template: Option<&Template>,
        _rendered_subject: Option<&str>,
        rendered_body: &str,
    ) -> Result<ProviderSendResult, ProviderError> {
        let mut content = notification.content();
        content.body = rendered_body.to_string();

        let message = BusMessage::notification(&user.id, &notification.id, "sse", content);
        self.bus.publish(message).map_err(|_| {
            ProviderError::new(ProviderErrorKind::ProviderApi, "no active sse subscribers")
        })?;
        Ok(ProviderSendResult::accepted(None))
    }

    fn supported_channel(&self) -> Channel {
        Channel::Sse
    }
}
