//! Built-in stages.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use docpipe_core::StageOutputRef;
use docpipe_enrichment::{ContentItem, ContentSource, Enrichment, EnrichmentInput};

use super::fanout::for_each_bounded;
use super::stage::{DeferredWork, Stage, StageContext, StageError, StageOutcome};
use crate::search::{VectorRecord, VectorStore};

/// One call to an external enrichment operation.
///
/// The operation sees the job's payload reference as its subject and the
/// previous stage's output reference as context.
pub struct EnrichmentStage {
    name: String,
    enrichment: Arc<dyn Enrichment>,
    collection: String,
    params: JsonValue,
    deferred: Option<DeferredWork>,
}

impl EnrichmentStage {
    pub fn new(
        name: impl Into<String>,
        enrichment: Arc<dyn Enrichment>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            enrichment,
            collection: collection.into(),
            params: JsonValue::Null,
            deferred: None,
        }
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }

    /// Declare deferred work on every successful run. An empty payload
    /// reference means "the job's own payload".
    pub fn with_deferred(mut self, work: DeferredWork) -> Self {
        self.deferred = Some(work);
        self
    }
}

#[async_trait]
impl Stage for EnrichmentStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let input = EnrichmentInput::new(ctx.payload_ref())
            .with_context(ctx.previous_output().await?)
            .with_params(self.params.clone());

        let output = self.enrichment.invoke(input).await?;
        let collection = format!("{}/{}", self.collection, ctx.job_id());
        let mut outcome = StageOutcome::new(StageOutputRef::items(collection, output.items));

        if let Some(work) = &self.deferred {
            let mut work = work.clone();
            if work.payload_ref.is_empty() {
                work.payload_ref = ctx.payload_ref().to_string();
            }
            outcome = outcome.with_deferred(work);
        }
        Ok(outcome)
    }
}

/// Derive one vector per (content item, space) and write it to the vector store.
pub struct EmbedStage {
    name: String,
    content: Arc<dyn ContentSource>,
    enrichment: Arc<dyn Enrichment>,
    vectors: Arc<dyn VectorStore>,
    spaces: Vec<String>,
    concurrency: usize,
}

impl EmbedStage {
    pub fn new(
        name: impl Into<String>,
        content: Arc<dyn ContentSource>,
        enrichment: Arc<dyn Enrichment>,
        vectors: Arc<dyn VectorStore>,
        spaces: Vec<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            name: name.into(),
            content,
            enrichment,
            vectors,
            spaces,
            concurrency,
        }
    }
}

#[async_trait]
impl Stage for EmbedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let items = self.content.items(ctx.payload_ref()).await?;
        let work: Vec<(ContentItem, String)> = items
            .into_iter()
            .flat_map(|item| self.spaces.iter().map(move |s| (item.clone(), s.clone())))
            .collect();
        let count = work.len() as u64;

        let enrichment = self.enrichment.clone();
        let vectors = self.vectors.clone();
        for_each_bounded(work, self.concurrency, move |(item, space)| {
            let enrichment = enrichment.clone();
            let vectors = vectors.clone();
            async move {
                let input = EnrichmentInput::new(item.text).with_params(json!({ "space": space }));
                let output = enrichment.invoke(input).await?;
                let vector = output.vector.ok_or_else(|| {
                    StageError::InvalidInput(format!(
                        "{} returned no vector for space {space}",
                        enrichment.name()
                    ))
                })?;
                vectors
                    .upsert(VectorRecord::new(item.entity_id, space, vector))
                    .await?;
                Ok::<_, StageError>(())
            }
        })
        .await?;

        debug!(job_id = %ctx.job_id(), vectors = count, "embeddings written");
        Ok(StageOutcome::new(StageOutputRef::Embeddings {
            spaces: self.spaces.clone(),
            count,
        }))
    }
}

/// Enrich a sub-job's items in fixed-size batches, persisting the batch
/// cursor after each one so a resumed run skips finished batches.
pub struct BulkEnrichmentStage {
    name: String,
    content: Arc<dyn ContentSource>,
    enrichment: Arc<dyn Enrichment>,
    batch_size: usize,
    concurrency: usize,
}

impl BulkEnrichmentStage {
    pub fn new(
        name: impl Into<String>,
        content: Arc<dyn ContentSource>,
        enrichment: Arc<dyn Enrichment>,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            name: name.into(),
            content,
            enrichment,
            batch_size: batch_size.max(1),
            concurrency,
        }
    }
}

#[async_trait]
impl Stage for BulkEnrichmentStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        let items = self.content.items(ctx.payload_ref()).await?;
        let total = items.len() as u64;
        let resumed_from = ctx.batch_cursor().min(total);
        let mut cursor = resumed_from;
        let mut batches = 0u64;
        let mut enriched = 0u64;

        let remaining: Vec<ContentItem> = items.into_iter().skip(resumed_from as usize).collect();
        for batch in remaining.chunks(self.batch_size) {
            let enrichment = self.enrichment.clone();
            let counts = for_each_bounded(batch.to_vec(), self.concurrency, move |item| {
                let enrichment = enrichment.clone();
                async move {
                    let output = enrichment.invoke(EnrichmentInput::new(item.text)).await?;
                    Ok::<_, StageError>(output.items)
                }
            })
            .await?;

            enriched += counts.iter().sum::<u64>();
            cursor += batch.len() as u64;
            batches += 1;
            ctx.save_batch_cursor(cursor).await?;
            debug!(job_id = %ctx.job_id(), cursor, total, "batch enriched");
        }

        Ok(StageOutcome::new(StageOutputRef::Enriched {
            operation: self.enrichment.name().to_string(),
            summary: json!({
                "items": total,
                "resumed_from": resumed_from,
                "batches": batches,
                "enriched": enriched,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::jobs::{ClaimOutcome, InMemoryJobStore, Job, JobKind, JobStore, SubJobKind};
    use crate::search::InMemoryVectorStore;
    use chrono::Utc;
    use docpipe_core::{EntityId, OwnerToken, StageDefinition};
    use docpipe_enrichment::{EnrichmentError, EnrichmentOutput, InMemoryContentSource, LocalEnrichment};
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn claimed_context(
        payload: &str,
        stage: &str,
        ordinal: u32,
    ) -> (StageContext, Arc<InMemoryJobStore>, Arc<InMemoryCheckpointStore>) {
        let jobs = InMemoryJobStore::arc();
        let checkpoints = InMemoryCheckpointStore::arc();
        let job = jobs
            .insert(Job::new(JobKind::DocumentProcessing, payload))
            .await
            .unwrap();
        let owner = OwnerToken::new();
        let now = Utc::now();
        let ClaimOutcome::Claimed(job) = jobs.claim(job.id, owner, now, now).await.unwrap() else {
            panic!("expected claim");
        };
        let ctx = StageContext::new(
            job,
            StageDefinition {
                name: stage.to_string(),
                weight: 10,
            },
            ordinal,
            owner,
            checkpoints.clone(),
            jobs.clone(),
        );
        (ctx, jobs, checkpoints)
    }

    fn content(payload: &str, n: usize) -> Arc<InMemoryContentSource> {
        let source = Arc::new(InMemoryContentSource::new());
        let items = (0..n)
            .map(|i| ContentItem::new(EntityId::new(), format!("item number {i}")))
            .collect();
        source.insert(payload, items).unwrap();
        source
    }

    #[tokio::test]
    async fn enrichment_stage_passes_previous_output_and_declares_work() {
        let (ctx, _jobs, checkpoints) = claimed_context("doc-7", "classify", 1).await;
        checkpoints
            .append(ctx.job_id(), "extract", 0, StageOutputRef::items("chunks", 4), Utc::now())
            .await
            .unwrap();

        let stage = EnrichmentStage::new("classify", Arc::new(LocalEnrichment::new("classifier", 8)), "labels")
            .with_deferred(DeferredWork::new(SubJobKind::BulkEnrichment, ""));
        let outcome = stage.run(&ctx).await.unwrap();

        assert_eq!(outcome.output.item_count(), Some(1));
        assert!(outcome.output.collection().unwrap().starts_with("labels/"));
        let work = outcome.deferred.unwrap();
        assert_eq!(work.payload_ref, "doc-7");
    }

    #[tokio::test]
    async fn embed_stage_writes_every_item_space_pair() {
        let (ctx, _jobs, _cps) = claimed_context("doc-1", "embed", 0).await;
        let source = content("doc-1", 5);
        let vectors = InMemoryVectorStore::arc();
        let stage = EmbedStage::new(
            "embed",
            source.clone(),
            Arc::new(LocalEnrichment::new("embedder", 16)),
            vectors.clone(),
            vec!["text".into(), "caption".into()],
            2,
        );

        let outcome = stage.run(&ctx).await.unwrap();
        assert_eq!(outcome.output.item_count(), Some(10));

        let items = source.items("doc-1").await.unwrap();
        for item in items {
            assert!(vectors.get(item.entity_id, "text").await.unwrap().is_some());
            assert!(vectors.get(item.entity_id, "caption").await.unwrap().is_some());
        }
    }

    struct CountingEnrichment {
        calls: AtomicU32,
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl Enrichment for CountingEnrichment {
        fn name(&self) -> &str {
            "counting"
        }

        async fn invoke(&self, _input: EnrichmentInput) -> Result<EnrichmentOutput, EnrichmentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.fail_on {
                return Err(EnrichmentError::Unavailable("blip".into()));
            }
            Ok(EnrichmentOutput::new(1))
        }
    }

    #[tokio::test]
    async fn bulk_stage_resumes_from_the_saved_cursor() {
        let (ctx, jobs, _cps) = claimed_context("bulk", "enrich_batch", 0).await;
        let source = content("bulk", 10);
        let enrichment = Arc::new(CountingEnrichment {
            calls: AtomicU32::new(0),
            fail_on: Some(7),
        });
        let stage = BulkEnrichmentStage::new("enrich_batch", source, enrichment.clone(), 3, 1);

        // Batches [0..3) and [3..6) finish; the third batch fails on call 7.
        assert!(stage.run(&ctx).await.is_err());
        assert_eq!(ctx.batch_cursor(), 6);
        assert_eq!(jobs.get(ctx.job_id()).await.unwrap().unwrap().batch_cursor, Some(6));

        let before = enrichment.calls.load(Ordering::SeqCst);
        let outcome = stage.run(&ctx).await.unwrap();
        assert_eq!(enrichment.calls.load(Ordering::SeqCst) - before, 4);
        assert_eq!(ctx.batch_cursor(), 10);
        match outcome.output {
            StageOutputRef::Enriched { summary, .. } => {
                assert_eq!(summary["resumed_from"], 6);
                assert_eq!(summary["batches"], 2);
            }
            other => panic!("unexpected output {other:?}"),
        }
    }
}
