mod error;
mod exchange;
mod relay;
mod rewrite;
mod server;

pub use error::{ProxyError, create_error_response};
pub use exchange::{Exchange, ExchangeState, LoggedStream};
pub use relay::{ProxyResponse, ResponseBody, StreamingRelay, UpstreamError, is_streaming_response};
pub use rewrite::{
    CLIENT_API_KEY_HEADER, CODING_AGENT_MODE_HEADER, HOP_BY_HOP_HEADERS, ModelRouting,
    OutboundRequest, ProxyRequest, RequestBody, RequestRewriter, RoutingError, VENDOR_KEY_HEADER,
};
pub use server::{AppState, ProxyServer, create_router};
