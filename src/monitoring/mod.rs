/*!
 * Monitoring
 * Tracing setup and timed spans for scheduler operations
 */

mod tracer;

pub use tracer::{init_tracing, span_operation, OperationSpan};
