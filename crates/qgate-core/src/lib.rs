pub mod account;
pub mod alert;
pub mod auth_manager;
pub mod bootstrap;
pub mod clock;
pub mod credential;
pub mod dedup;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod payload;
pub mod pool;
pub mod quota;
pub mod upstream_client;

pub use account::{AccountProvider, ProviderRuntimeState, ProviderStatus, SearchResult};
pub use alert::{AlertEngine, AlertOptions};
pub use auth_manager::{
    generate_pkce, AuthError, AuthManager, DeviceAuthorization, DeviceExchange,
};
pub use credential::QwenCredential;
pub use dedup::{dedup_stream, SseDedup};
pub use deferred::DeferredTasks;
pub use dispatch::Dispatcher;
pub use error::AccountFailure;
pub use pool::{PoolOptions, ProviderPool, ScanMode};
pub use quota::{AccountUsage, Admission, LimitReason, QuotaManager, UsageKind};
pub use upstream_client::{
    ByteStream, ReqwestUpstreamClient, TransportError, UpstreamBody, UpstreamClient,
    UpstreamHttpRequest, UpstreamHttpResponse,
};
