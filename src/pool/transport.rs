use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::core::{DataRequest, GatewayError, GatewayResult, Transport, TransportError};

/// JSON over HTTP/1.1 to `http://<address><endpoint>`.
///
/// `reqwest::Client` keeps the keep-alive connections per replica.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Configuration(format!("unable to build http client: {e}")))?;
        Ok(Self { client })
    }

    fn url(address: &str, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("http://{address}{endpoint}")
        } else {
            format!("http://{address}/{endpoint}")
        }
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_decode() {
        TransportError::Malformed(err.to_string())
    } else {
        TransportError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(
        &self,
        address: &str,
        endpoint: &str,
        request: DataRequest,
    ) -> Result<DataRequest, TransportError> {
        let url = Self::url(address, endpoint);
        log::trace!("POST {url} ({} docs)", request.docs.len());

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status(status.as_u16(), body));
        }

        response
            .json::<DataRequest>()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }

    async fn is_reachable(&self, address: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }
}
