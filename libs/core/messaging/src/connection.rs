use crate::config::BrokerEndpoint;
use crate::error::BrokerError;
use crate::transport::{Channel, CloseSignal, Link, Transport};
use tracing::{debug, warn};

/// A dialed link plus its channel, owned by exactly one producer or consumer.
pub struct Connection {
    endpoint: BrokerEndpoint,
    link: Box<dyn Link>,
    channel: Box<dyn Channel>,
}

impl Connection {
    /// Dials the endpoint and opens a channel. Makes a single attempt.
    ///
    /// A dial failure is returned as [`BrokerError::Connection`]. A channel
    /// failure closes the dialed link first and is returned as
    /// [`BrokerError::Channel`].
    pub async fn connect(
        transport: &dyn Transport,
        endpoint: &BrokerEndpoint,
    ) -> Result<Self, BrokerError> {
        let link = transport
            .dial(endpoint)
            .await
            .map_err(|e| BrokerError::connection(endpoint.to_string(), e))?;

        let channel = match link.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = link.close().await {
                    warn!(endpoint = %endpoint, error = %close_err, "Failed to close link after channel error");
                }
                return Err(BrokerError::channel(e));
            }
        };

        debug!(endpoint = %endpoint, transport = transport.name(), "Connection established");

        Ok(Self {
            endpoint: endpoint.clone(),
            link,
            channel,
        })
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }

    pub fn close_signal(&self) -> Option<CloseSignal> {
        self.link.close_signal()
    }

    /// Closes the channel and then the link. Failures are logged.
    pub async fn close(self) {
        if let Err(e) = self.channel.close().await {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to close channel");
        }
        if let Err(e) = self.link.close().await {
            warn!(endpoint = %self.endpoint, error = %e, "Failed to close connection");
        }
        debug!(endpoint = %self.endpoint, "Connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
