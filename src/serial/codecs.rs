/// Newline framing for device traffic.
pub mod lines;
