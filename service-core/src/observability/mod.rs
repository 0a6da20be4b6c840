pub mod logging;
pub mod propagation;

pub use logging::init_tracing;
pub use propagation::{
    REQUEST_ID_HEADER, TRACEPARENT_HEADER, TracedClientExt, current_traceparent,
    inject_trace_headers,
};
