pub mod bucket;
pub mod dispatcher;
pub mod error;
pub mod global;
pub mod route;
pub mod transport;

pub use bucket::{BucketRegistry, RateLimitBucket, RateLimitError, RateLimitHeaders};
pub use dispatcher::{RequestDispatcher, RequestOptions};
pub use error::{HttpError, ResponseError};
pub use global::GlobalThrottle;
pub use route::Route;
pub use transport::{File, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
