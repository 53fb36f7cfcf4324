pub mod event;
pub mod expand;
pub mod items;
pub mod metrics;
pub mod normalize;
pub mod queue;
pub mod sink;
