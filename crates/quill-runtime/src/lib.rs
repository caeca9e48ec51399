//! Skill catalog, job executors, and service assembly for the `quill` binary.

pub mod agent_executor;
pub mod catalog;
pub mod command_executor;
pub mod router;
pub mod service;

pub use agent_executor::{skill_error_from_pool, AgentSkillExecutor};
pub use catalog::{
    load_skill_catalog, render_skill_template, AgentSkillSpec, CatalogSkill, CommandSkillSpec,
    SkillCatalog, SkillExecutorSpec, DEFAULT_SKILL_TIMEOUT_MS, SKILL_CATALOG_SCHEMA_VERSION,
};
pub use command_executor::{
    validate_json_output, CommandSkillExecutor, SKILL_ID_ENV, SKILL_INPUT_ENV,
};
pub use router::SkillExecutorRouter;
pub use service::{QuillService, QuillServiceConfig, CACHE_DIR_NAME, SCHEDULER_DIR_NAME};
