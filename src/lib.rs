pub mod alert;
pub mod config;
pub mod filetype;
pub mod media;
pub mod message;
pub mod nlp;
pub mod pipeline;
pub mod report;
pub mod sanitize;
pub mod spam;

pub use alert::{AlertChannel, AlertDispatcher, ChannelOutcome};
pub use config::Config;
pub use media::{DeepfakeScanner, MediaAuthenticityAnalyzer};
pub use message::{MessageBuilder, NormalizedMessage, RawMail};
pub use nlp::{NlpThreatAnalyzer, NoopClassifier, TextClassifier};
pub use pipeline::AnalysisPipeline;
pub use report::{AnalysisResult, Indicator, RiskLevel, ThreatReport};
pub use spam::SpamAnalyzer;
