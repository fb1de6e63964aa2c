//! Session-scoped orchestration: one pipeline is built at startup and reused
//! for every message. Per message, the three analyzers fan out onto blocking
//! tasks over one shared immutable [`NormalizedMessage`] and fan back in
//! before aggregation; a semaphore bounds how many messages are in flight at
//! once. A layer that overruns its budget is replaced by a conservative
//! timeout result instead of sinking the message.

use crate::alert::{AlertDispatcher, ChannelOutcome};
use crate::config::{Config, TimeoutConfig};
use crate::media::MediaAuthenticityAnalyzer;
use crate::message::{MessageBuilder, NormalizedMessage, RawMail};
use crate::nlp::{NlpThreatAnalyzer, TextClassifier};
use crate::report::{Aggregator, AnalysisResult, Layer, MessageSummary, ThreatReport};
use crate::spam::SpamAnalyzer;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct AnalysisPipeline {
    builder: MessageBuilder,
    spam: Arc<SpamAnalyzer>,
    nlp: Arc<NlpThreatAnalyzer>,
    media: Arc<MediaAuthenticityAnalyzer>,
    aggregator: Aggregator,
    dispatcher: Arc<AlertDispatcher>,
    semaphore: Arc<Semaphore>,
    timeouts: TimeoutConfig,
}

impl AnalysisPipeline {
    pub fn new(config: &Config, classifier: Box<dyn TextClassifier>) -> Result<Self> {
        let dispatcher = AlertDispatcher::from_config(config)?;
        Ok(Self::with_dispatcher(config, classifier, dispatcher))
    }

    pub fn with_dispatcher(
        config: &Config,
        classifier: Box<dyn TextClassifier>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self {
            builder: MessageBuilder::new(config),
            spam: Arc::new(SpamAnalyzer::new(config)),
            nlp: Arc::new(NlpThreatAnalyzer::new(config, classifier)),
            media: Arc::new(MediaAuthenticityAnalyzer::new(config)),
            aggregator: Aggregator::new(config.scoring.clone()),
            dispatcher: Arc::new(dispatcher),
            semaphore: Arc::new(Semaphore::new(config.runtime.max_concurrent_messages)),
            timeouts: config.timeouts.clone(),
        }
    }

    /// Pre-fetch gate; the transport calls this before retrieving a payload.
    pub fn admits_announced_size(&self, announced: u64) -> bool {
        self.builder.admits_announced_size(announced)
    }

    /// Analyze one raw message. All three layers complete (or time out)
    /// before aggregation; there is no partial aggregation.
    pub async fn analyze(&self, raw: RawMail) -> ThreatReport {
        // The semaphore is never closed, so acquire only fails if it were.
        let _permit = Arc::clone(&self.semaphore).acquire_owned().await.ok();

        let message = Arc::new(self.builder.build(raw));
        let summary = MessageSummary::from_message(&message);

        let spam_handle = {
            let analyzer = Arc::clone(&self.spam);
            let message = Arc::clone(&message);
            tokio::task::spawn_blocking(move || analyzer.analyze(&message))
        };
        let nlp_handle = {
            let analyzer = Arc::clone(&self.nlp);
            let message = Arc::clone(&message);
            tokio::task::spawn_blocking(move || analyzer.analyze(&message))
        };
        let media_handle = {
            let analyzer = Arc::clone(&self.media);
            let message: Arc<NormalizedMessage> = Arc::clone(&message);
            tokio::task::spawn_blocking(move || {
                analyzer.analyze(&message.attachments, message.truncation)
            })
        };

        let spam = self
            .await_layer(spam_handle, self.timeouts.spam_ms, Layer::Spam)
            .await;
        let nlp = self
            .await_layer(nlp_handle, self.timeouts.nlp_ms, Layer::Nlp)
            .await;
        let media = self
            .await_layer(media_handle, self.timeouts.media_ms, Layer::Media)
            .await;

        self.aggregator.aggregate(summary, spam, nlp, media)
    }

    /// Analyze and dispatch alerts for one message.
    pub async fn process(&self, raw: RawMail) -> (ThreatReport, Vec<ChannelOutcome>) {
        let report = self.analyze(raw).await;
        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatch_report = report.clone();
        let outcomes =
            match tokio::task::spawn_blocking(move || dispatcher.dispatch(&dispatch_report)).await
            {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    log::error!("alert dispatch task failed: {}", e);
                    Vec::new()
                }
            };
        (report, outcomes)
    }

    async fn await_layer(
        &self,
        handle: JoinHandle<AnalysisResult>,
        budget_ms: u64,
        layer: Layer,
    ) -> AnalysisResult {
        let budget = Duration::from_millis(budget_ms);
        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                log::error!("{:?} analyzer task failed: {}", layer, e);
                AnalysisResult::timed_out(layer, self.timeouts.timeout_score)
            }
            Err(_) => {
                log::warn!("{:?} analyzer exceeded {}ms budget", layer, budget_ms);
                AnalysisResult::timed_out(layer, self.timeouts.timeout_score)
            }
        }
    }
}
