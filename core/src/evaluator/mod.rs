//! Driver for the single long-lived evaluator process.
//!
//! Every caller goes through [`EvaluatorHandle`]; requests are queued and
//! served strictly one at a time, in submission order.

mod driver;
mod response;

pub(crate) use driver::nix_string;
pub use driver::{EvaluatorDriver, EvaluatorHandle};
pub use response::{classify_response, parse_response, strip_ansi};
