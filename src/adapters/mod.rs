// Adapters layer: concrete implementations of the domain ports.

pub mod http_fetcher;
pub mod keyword_classifier;
pub mod notifier;

pub use http_fetcher::HttpFetcher;
pub use keyword_classifier::{AmbiguityPolicy, KeywordClassifier, KeywordRules};
pub use notifier::{LogNotifier, WebhookNotifier};
