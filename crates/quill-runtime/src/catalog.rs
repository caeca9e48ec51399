//! JSON skill catalog: which skills exist, how they bucket, how they run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use quill_scheduler::{FanOutGroup, FetchPlan, ScheduledSkill};
use quill_skill_cache::{BucketPolicy, SkillClass};
use serde::{Deserialize, Serialize};

pub const SKILL_CATALOG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_SKILL_TIMEOUT_MS: u64 = 300_000;
const FAN_OUT_ID_SEPARATOR: char = ':';

fn skill_catalog_schema_version() -> u32 {
    SKILL_CATALOG_SCHEMA_VERSION
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_skill_timeout_ms() -> u64 {
    DEFAULT_SKILL_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

fn default_every_ticks() -> u32 {
    1
}

fn default_batch_size() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One-shot program run per execution.
pub struct CommandSkillSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// When set, the result is read from this file instead of stdout.
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub expect_json: bool,
    #[serde(default = "default_skill_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One conversation turn on a pooled agent session.
pub struct AgentSkillSpec {
    pub prompt: String,
    #[serde(default)]
    pub expect_json: bool,
    #[serde(default = "default_skill_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkillExecutorSpec {
    Command(CommandSkillSpec),
    Agent(AgentSkillSpec),
}

impl SkillExecutorSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Agent(_) => "agent",
        }
    }

    fn validate(&self, skill_id: &str) -> Result<()> {
        let timeout_ms = match self {
            Self::Command(spec) => {
                if spec.program.trim().is_empty() {
                    bail!("skill '{skill_id}' command program must be non-empty");
                }
                spec.timeout_ms
            }
            Self::Agent(spec) => {
                if spec.prompt.trim().is_empty() {
                    bail!("skill '{skill_id}' agent prompt must be non-empty");
                }
                spec.timeout_ms
            }
        };
        if timeout_ms == 0 {
            bail!("skill '{skill_id}' timeout_ms must be greater than 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogSkillEntry {
    id: String,
    class: SkillClass,
    executor: SkillExecutorSpec,
    #[serde(default)]
    input: Option<String>,
    #[serde(default = "default_true")]
    scheduled: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFanOutEntry {
    group: String,
    sub_groups: Vec<String>,
    class: SkillClass,
    executor: SkillExecutorSpec,
    #[serde(default = "default_every_ticks")]
    every_ticks: u32,
    #[serde(default = "default_batch_size")]
    batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct SkillCatalogFile {
    #[serde(default = "skill_catalog_schema_version")]
    schema_version: u32,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    skills: Vec<CatalogSkillEntry>,
    #[serde(default)]
    fan_out: Vec<CatalogFanOutEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSkill {
    pub id: String,
    pub group: Option<String>,
    pub policy: BucketPolicy,
    pub executor: SkillExecutorSpec,
    pub input: Option<String>,
    pub scheduled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Validated catalog with fan-out groups expanded into `group:sub` skills.
pub struct SkillCatalog {
    timezone: Tz,
    skills: Vec<CatalogSkill>,
    fan_out: Vec<FanOutGroup>,
}

impl SkillCatalog {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file = serde_json::from_str::<SkillCatalogFile>(raw)
            .context("failed to parse skill catalog JSON")?;
        if file.schema_version != SKILL_CATALOG_SCHEMA_VERSION {
            bail!(
                "unsupported skill catalog schema: expected {}, found {}",
                SKILL_CATALOG_SCHEMA_VERSION,
                file.schema_version
            );
        }
        let timezone = file
            .timezone
            .trim()
            .parse::<Tz>()
            .map_err(|error| anyhow!("invalid catalog timezone '{}': {error}", file.timezone))?;

        let mut skills = Vec::new();
        for entry in file.skills {
            let id = entry.id.trim().to_string();
            if id.is_empty() {
                bail!("skill id must be non-empty");
            }
            if id.contains(FAN_OUT_ID_SEPARATOR) {
                bail!("skill id '{id}' must not contain '{FAN_OUT_ID_SEPARATOR}'");
            }
            entry.executor.validate(&id)?;
            let policy = BucketPolicy::new(entry.class, timezone)
                .with_context(|| format!("skill '{id}' has an invalid class"))?;
            skills.push(CatalogSkill {
                id,
                group: None,
                policy,
                executor: entry.executor,
                input: entry.input,
                scheduled: entry.scheduled,
            });
        }

        let mut fan_out = Vec::new();
        for entry in file.fan_out {
            let group = entry.group.trim().to_string();
            if group.is_empty() || group.contains(FAN_OUT_ID_SEPARATOR) {
                bail!("fan-out group name '{group}' must be non-empty without '{FAN_OUT_ID_SEPARATOR}'");
            }
            if entry.sub_groups.is_empty() {
                bail!("fan-out group '{group}' must declare at least one sub_group");
            }
            entry.executor.validate(&group)?;
            let policy = BucketPolicy::new(entry.class, timezone)
                .with_context(|| format!("fan-out group '{group}' has an invalid class"))?;
            let mut members = Vec::with_capacity(entry.sub_groups.len());
            for sub_group in entry.sub_groups {
                let sub_group = sub_group.trim();
                if sub_group.is_empty() {
                    bail!("fan-out group '{group}' has an empty sub_group");
                }
                let id = format!("{group}{FAN_OUT_ID_SEPARATOR}{sub_group}");
                skills.push(CatalogSkill {
                    id: id.clone(),
                    group: Some(group.clone()),
                    policy: policy.clone(),
                    executor: entry.executor.clone(),
                    input: Some(sub_group.to_string()),
                    scheduled: true,
                });
                members.push(ScheduledSkill::new(id).with_input(sub_group));
            }
            fan_out.push(FanOutGroup {
                group,
                members,
                every_ticks: entry.every_ticks,
                batch_size: entry.batch_size,
            });
        }

        let mut seen = BTreeSet::new();
        for skill in &skills {
            if !seen.insert(skill.id.as_str()) {
                bail!("skill '{}' is declared more than once", skill.id);
            }
        }
        let catalog = Self {
            timezone,
            skills,
            fan_out,
        };
        catalog.fetch_plan().validate()?;
        Ok(catalog)
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn skills(&self) -> &[CatalogSkill] {
        &self.skills
    }

    pub fn skill(&self, skill_id: &str) -> Option<&CatalogSkill> {
        self.skills.iter().find(|skill| skill.id == skill_id)
    }

    pub fn skill_ids(&self) -> Vec<String> {
        self.skills.iter().map(|skill| skill.id.clone()).collect()
    }

    pub fn bucket_policies(&self) -> BTreeMap<String, BucketPolicy> {
        self.skills
            .iter()
            .map(|skill| (skill.id.clone(), skill.policy.clone()))
            .collect()
    }

    pub fn uses_agent(&self) -> bool {
        self.skills
            .iter()
            .any(|skill| matches!(skill.executor, SkillExecutorSpec::Agent(_)))
    }

    /// Scheduled standalone skills plus every fan-out group.
    pub fn fetch_plan(&self) -> FetchPlan {
        FetchPlan {
            skills: self
                .skills
                .iter()
                .filter(|skill| skill.scheduled && skill.group.is_none())
                .map(|skill| ScheduledSkill {
                    skill_id: skill.id.clone(),
                    input: skill.input.clone(),
                })
                .collect(),
            fan_out: self.fan_out.clone(),
        }
    }
}

pub fn load_skill_catalog(path: &Path) -> Result<SkillCatalog> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read skill catalog {}", path.display()))?;
    SkillCatalog::from_json_str(&raw)
        .with_context(|| format!("invalid skill catalog {}", path.display()))
}

/// Substitutes `{skill_id}` and `{input}` placeholders.
pub fn render_skill_template(template: &str, skill_id: &str, input: &str) -> String {
    template
        .replace("{skill_id}", skill_id)
        .replace("{input}", input)
}
