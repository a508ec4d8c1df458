use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;

pub type Headers = Vec<(String, String)>;
pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl UpstreamBody {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            UpstreamBody::Bytes(bytes) => Some(bytes),
            UpstreamBody::Stream(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamHttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: UpstreamBody::Bytes(Bytes::from(body.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
    /// Absolute deadline for the call; a deadline hit surfaces as a distinct
    /// timeout failure rather than a generic transport error.
    pub timeout: Duration,
}

impl UpstreamHttpRequest {
    pub fn post(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            is_stream: false,
            timeout,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_body(mut self, value: &serde_json::Value) -> Self {
        self.headers
            .push(("content-type".to_string(), "application/json".to_string()));
        self.body = Some(Bytes::from(value.to_string()));
        self
    }

    pub fn form_body(mut self, pairs: &[(&str, &str)]) -> Self {
        let encoded = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        self.headers.push((
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        ));
        self.body = Some(Bytes::from(encoded));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

/// Transport-level failure (no HTTP response was produced).
#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            message: format!("deadline of {}s exceeded", limit.as_secs()),
        }
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>;
}

#[derive(Clone)]
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
}

impl ReqwestUpstreamClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

impl UpstreamClient for ReqwestUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let method = match req.method {
                HttpMethod::Get => reqwest::Method::GET,
                HttpMethod::Post => reqwest::Method::POST,
            };
            let mut builder = self.client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body.clone() {
                builder = builder.body(body);
            }

            let response = tokio::time::timeout(req.timeout, builder.send())
                .await
                .map_err(|_| TransportError::timeout(req.timeout))?
                .map_err(map_reqwest_error)?;

            convert_response(response, req.is_stream, req.timeout).await
        })
    }
}

async fn convert_response(
    response: reqwest::Response,
    want_stream: bool,
    deadline: Duration,
) -> Result<UpstreamHttpResponse, TransportError> {
    let status = response.status().as_u16();
    let headers = headers_from_reqwest(response.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = tokio::time::timeout(deadline, response.bytes())
            .await
            .map_err(|_| TransportError::timeout(deadline))?
            .map_err(map_reqwest_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    // Streaming bodies: the per-call deadline becomes an idle timeout between
    // chunks so a stalled upstream cannot pin the connection forever.
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(deadline, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => break,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_reqwest(map: &reqwest::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    TransportError {
        kind,
        message: err.to_string(),
    }
}

#[cfg(test)]
pub mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    enum Scripted {
        Response {
            status: u16,
            headers: Headers,
            body: Bytes,
        },
        Stream {
            status: u16,
            headers: Headers,
            chunks: Vec<Bytes>,
        },
        Transport(TransportError),
    }

    /// Scriptable upstream used by unit tests: responses are served in FIFO
    /// order and every request is recorded for inspection.
    #[derive(Default)]
    pub struct MockUpstreamClient {
        script: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<UpstreamHttpRequest>>,
    }

    impl MockUpstreamClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_json(&self, status: u16, body: serde_json::Value) {
            self.script
                .lock()
                .unwrap()
                .push_back(Scripted::Response {
                    status,
                    headers: vec![(
                        "content-type".to_string(),
                        "application/json".to_string(),
                    )],
                    body: Bytes::from(body.to_string()),
                });
        }

        pub fn push_body(&self, status: u16, headers: Headers, body: impl Into<Bytes>) {
            self.script.lock().unwrap().push_back(Scripted::Response {
                status,
                headers,
                body: body.into(),
            });
        }

        pub fn push_stream(&self, status: u16, chunks: Vec<Bytes>) {
            self.script.lock().unwrap().push_back(Scripted::Stream {
                status,
                headers: vec![(
                    "content-type".to_string(),
                    "text/event-stream".to_string(),
                )],
                chunks,
            });
        }

        pub fn push_transport(&self, error: TransportError) {
            self.script
                .lock()
                .unwrap()
                .push_back(Scripted::Transport(error));
        }

        pub fn requests(&self) -> Vec<UpstreamHttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl UpstreamClient for MockUpstreamClient {
        fn send<'a>(
            &'a self,
            req: UpstreamHttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, TransportError>> + Send + 'a>>
        {
            let scripted = self.script.lock().unwrap().pop_front();
            self.requests.lock().unwrap().push(req);
            Box::pin(async move {
                match scripted {
                    Some(Scripted::Response {
                        status,
                        headers,
                        body,
                    }) => Ok(UpstreamHttpResponse {
                        status,
                        headers,
                        body: UpstreamBody::Bytes(body),
                    }),
                    Some(Scripted::Stream {
                        status,
                        headers,
                        chunks,
                    }) => {
                        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
                        tokio::spawn(async move {
                            for chunk in chunks {
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                        });
                        Ok(UpstreamHttpResponse {
                            status,
                            headers,
                            body: UpstreamBody::Stream(rx),
                        })
                    }
                    Some(Scripted::Transport(error)) => Err(error),
                    None => Ok(UpstreamHttpResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Bytes(Bytes::from_static(b"{}")),
                    }),
                }
            })
        }
    }
}
