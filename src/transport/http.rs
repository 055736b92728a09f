use std::time::Duration;

use tracing::{debug, warn};

use super::{Inbound, InboundSender, Transport, TransportOptions, unreachable};
use crate::error::ClientResult;
use crate::protocol::{PredictRequest, PredictResponse, RequestFrame, ResponseFrame};

/// JSON-over-HTTP transport. Every frame becomes one `POST /predict/{service}`
/// on its own task; the response (or failure) is reported as [`Inbound`].
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    inbound: InboundSender,
}

impl HttpTransport {
    pub async fn connect(
        service: &str,
        address: &str,
        inbound: InboundSender,
        options: TransportOptions,
    ) -> ClientResult<Self> {
        let base_url = normalize_base_url(address);
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(leak_guard_timeout(options.request_timeout))
            .build()
            .map_err(|e| unreachable(service, address, e))?;

        let health_url = api_path(&base_url, "/health");
        match client.get(&health_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("Health check passed for {} at {}", service, base_url);
            }
            Ok(resp) => {
                return Err(unreachable(
                    service,
                    address,
                    format!("health check returned {}", resp.status()),
                ));
            }
            Err(e) => return Err(unreachable(service, address, e)),
        }

        Ok(Self {
            base_url,
            client,
            inbound,
        })
    }
}

impl Transport for HttpTransport {
    fn send(&self, frame: RequestFrame) -> ClientResult<()> {
        let url = api_path(&self.base_url, &format!("/predict/{}", frame.service));
        let body = PredictRequest {
            ids: frame.ids,
            inputs: frame.inputs,
        };
        let client = self.client.clone();
        let inbound = self.inbound.clone();

        tokio::spawn(async move {
            let ids = body.ids.clone();
            let frame = match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<PredictResponse>().await {
                        Ok(parsed) => ResponseFrame::from(parsed),
                        Err(e) => {
                            warn!("Undecodable response from {}: {}", url, e);
                            ResponseFrame::unavailable(ids)
                        }
                    }
                }
                Ok(resp) => {
                    debug!("{} returned {}", url, resp.status());
                    ResponseFrame::unavailable(ids)
                }
                Err(e) => {
                    debug!("Request to {} failed: {}", url, e);
                    ResponseFrame::unavailable(ids)
                }
            };
            let _ = inbound.send(Inbound::Response(frame));
        });
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.base_url
    }
}

/// The client's own timer owns timeouts; reqwest only guards against leaks.
fn leak_guard_timeout(request_timeout: Duration) -> Duration {
    request_timeout.saturating_mul(2)
}

fn normalize_base_url(address: &str) -> String {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };
    url.trim_end_matches('/').to_string()
}

fn api_path(base_url: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{}{}", base_url, path)
    } else {
        format!("{}/{}", base_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_scheme_and_loses_trailing_slash() {
        assert_eq!(normalize_base_url("127.0.0.1:8000"), "http://127.0.0.1:8000");
        assert_eq!(
            normalize_base_url("https://models.internal/"),
            "https://models.internal"
        );
    }

    #[test]
    fn test_leak_guard_timeout_saturates() {
        assert_eq!(
            leak_guard_timeout(Duration::from_millis(1500)),
            Duration::from_secs(3)
        );
        assert_eq!(leak_guard_timeout(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_api_path_joins_with_single_slash() {
        assert_eq!(
            api_path("http://h:1", "/predict/vgg"),
            "http://h:1/predict/vgg"
        );
        assert_eq!(api_path("http://h:1", "health"), "http://h:1/health");
    }
}
