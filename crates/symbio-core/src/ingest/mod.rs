mod categories;
mod extractor;
mod html;
mod model;
mod normalizer;
mod pipeline;
mod tabular;
pub mod units;
mod validation;

pub use categories::{CategoryKeywords, CategoryTable};
pub use extractor::{
    detect_kind, sentence_span, ExtractionError, ExtractionStrategy, Extractor, FactExtractor,
    RuleBasedExtractor,
};
pub use model::{
    parse_reply, ChatCompletionsModel, CompletionModel, CompletionRequest, DecodingConfig,
    ModelAssistedExtractor, ModelFact,
};
pub use normalizer::{
    clean_text, decode_bytes, ContentNormalizer, FuzzyMatchResolver, NormalizeError,
    NormalizeResult, ResolvedName,
};
pub use pipeline::{
    DocumentReport, IngestError, IngestResult, Orchestrator, OrchestratorConfig, PendingStream,
    PipelineStats,
};
pub use tabular::{
    CanonicalField, ColumnAliases, Fate, ProfileMatch, RowOutcome, SchemaError, SchemaProfile,
    SkippedValue, TabularConfig, TabularError, TabularOutcome, TabularParser,
};
pub use units::{Quantity, UnknownUnit};
pub use validation::{
    citation_in_text, match_form, ExtractionResult, FactCandidate, Rejection, RejectionCategory,
    ValidationBounds, Validator,
};
