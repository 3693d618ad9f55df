pub(crate) mod codecs;
pub mod event_target;
pub mod time_ranges;
pub(crate) mod url;
