pub mod article;
pub mod loaders;
pub mod outline;
pub mod section;
pub mod source;

pub use article::{ArticlePreferences, ArticleState};
pub use loaders::{load_all_jobs, load_job, ArticleJob};
pub use outline::{H2Node, Outline, OutlineNode, SectionIndex, SectionType};
pub use section::{count_words, QualityMetrics, SectionRecord};
pub use source::Source;
