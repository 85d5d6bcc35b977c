pub mod builder;
pub mod code_import;
pub mod config;
pub mod correlator;
pub mod database;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod merger;
pub mod normalize;
pub mod pipeline;
pub mod queries;
pub mod symbols;
pub mod worker;

pub use builder::{
    BuildReport, ChildEntity, ChildFailure, RequestGraphBuilder, CONTEXT_FILE_LABEL, MESSAGE_LABEL,
    REQUEST_LABEL, TOOL_CALL_LABEL,
};
pub use code_import::{import_code_json, import_directory, import_source_file, CodeImportSummary};
pub use config::{CorrelatorConfig, EngineConfig, ExtractionConfig, SimilarityConfig, TtlPolicy};
pub use correlator::{Correlation, CorrelationState, EntityCorrelator};
pub use database::{Database, ENTITY_LABEL};
pub use error::{IngestError, Result};
pub use extraction::{
    conversation_episode, EpisodeSubmitter, ExtractionService, HttpExtractionClient,
};
pub use graph::{
    shared, EdgeMerge, GraphEdge, GraphNode, GraphStore, NodeAnnotation, NodeMerge, SharedGraph,
};
pub use merger::{BatchMerger, MergeContext, MergeOptions, MergeSummary};
pub use normalize::{normalize_record, parse_record_batch, slugify, NormalizedRecord};
pub use pipeline::{
    CacheInvalidation, ConversationIngestor, IngestionReport, InvalidationSink, NoopInvalidation,
};
pub use queries::{
    ContextFileStats, ConversationFlow, FlowMessage, RequestSummary, TimeWindow, ToolStats,
};
pub use symbols::{parse_python_symbols, try_parse_python_symbols};
pub use worker::{merge_partitioned, IngestionWorker};
