pub mod section_ctx;
pub mod section_flow;
pub mod section_state;

pub use section_ctx::SectionCtx;
pub use section_flow::SectionFlow;
pub use section_state::{SectionState, SectionTracker};
