//! Stateless facade over the core operations
//!
//! Each call names the store it works on. In dry-run mode the first touch of a
//! path snapshots what is on disk into a memory backend, and every later call
//! on that path in this service sees the dry-run writes made so far.

use crate::{knowledge_backend, transcript_backend};
use chrono::Utc;
use parking_lot::Mutex;
use reqx_core::{
    normalize_at, Extraction, KeyedItemDrafter, ProjectKnowledge, Role, SessionId, SpecDocument,
    SpecDrafter, TagExtractor, TranscriptEntry, TranscriptRole,
};
use reqx_storage::{
    KnowledgeBackend, Result, StoreConfig, TranscriptBackend, TranscriptStore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct CoreService {
    config: StoreConfig,
    dry_run: bool,
    extractor: TagExtractor,
    drafter: Box<dyn SpecDrafter>,
    transcripts: TranscriptStore,
    knowledge_overlays: Mutex<HashMap<PathBuf, Arc<dyn KnowledgeBackend>>>,
    transcript_overlays: Mutex<HashMap<PathBuf, Arc<dyn TranscriptBackend>>>,
}

impl Default for CoreService {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl CoreService {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            dry_run: false,
            extractor: TagExtractor::new(),
            drafter: Box::new(KeyedItemDrafter::new()),
            transcripts: TranscriptStore::new(config),
            knowledge_overlays: Mutex::new(HashMap::new()),
            transcript_overlays: Mutex::new(HashMap::new()),
        }
    }

    /// Keep every mutation in memory
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_extractor(mut self, extractor: TagExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_drafter(mut self, drafter: Box<dyn SpecDrafter>) -> Self {
        self.drafter = drafter;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn knowledge(&self, path: &Path) -> Result<Arc<dyn KnowledgeBackend>> {
        if !self.dry_run {
            return knowledge_backend(path, &self.config, false);
        }
        let mut overlays = self.knowledge_overlays.lock();
        if let Some(backend) = overlays.get(path) {
            return Ok(Arc::clone(backend));
        }
        let backend = knowledge_backend(path, &self.config, true)?;
        overlays.insert(path.to_path_buf(), Arc::clone(&backend));
        Ok(backend)
    }

    fn transcript(&self, path: &Path) -> Result<Arc<dyn TranscriptBackend>> {
        if !self.dry_run {
            return transcript_backend(path, &self.config, false);
        }
        let mut overlays = self.transcript_overlays.lock();
        if let Some(backend) = overlays.get(path) {
            return Ok(Arc::clone(backend));
        }
        let backend = transcript_backend(path, &self.config, true)?;
        overlays.insert(path.to_path_buf(), Arc::clone(&backend));
        Ok(backend)
    }

    // ========================================================================
    // Knowledge
    // ========================================================================

    /// Split a model reply into display text and items to append
    pub fn extract(&self, reply: &str) -> Extraction {
        self.extractor.extract(reply)
    }

    pub fn append(&self, path: &Path, role: Role, texts: &[String]) -> Result<ProjectKnowledge> {
        self.knowledge(path)?.append(role, texts)
    }

    pub fn read(&self, path: &Path) -> Result<ProjectKnowledge> {
        self.knowledge(path)?.read()
    }

    pub fn set_project_name(&self, path: &Path, name: &str) -> Result<ProjectKnowledge> {
        self.knowledge(path)?.set_project_name(name)
    }

    /// Draft and normalize a specification from the store. Nothing is written.
    pub fn generate_spec(&self, path: &Path) -> Result<SpecDocument> {
        let knowledge = self.read(path)?;
        Ok(normalize_at(&self.drafter.draft(&knowledge), Utc::now()))
    }

    /// [`generate_spec`](Self::generate_spec), then store the document as the
    /// latest specification
    pub fn generate_and_store_spec(&self, path: &Path) -> Result<SpecDocument> {
        let spec = self.generate_spec(path)?;
        self.knowledge(path)?.set_latest_spec(&spec)?;
        tracing::debug!(path = %path.display(), valid = spec.is_valid(), "specification stored");
        Ok(spec)
    }

    // ========================================================================
    // Transcripts
    // ========================================================================

    pub fn start_transcript(&self, path: &Path, resume: bool) -> Result<SessionId> {
        let backend = self.transcript(path)?;
        self.transcripts.start_session_with(backend, resume)
    }

    /// `None` when `content` is blank
    pub fn append_transcript(
        &self,
        session_id: SessionId,
        role: TranscriptRole,
        content: &str,
    ) -> Result<Option<TranscriptEntry>> {
        self.transcripts.append(session_id, role, content)
    }

    pub fn read_transcript(&self, path: &Path) -> Result<Vec<TranscriptEntry>> {
        Ok(self
            .transcript(path)?
            .load()?
            .map(|log| log.entries)
            .unwrap_or_default())
    }
}
