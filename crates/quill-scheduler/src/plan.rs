use std::collections::BTreeSet;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledSkill {
    pub skill_id: String,
    #[serde(default)]
    pub input: Option<String>,
}

impl ScheduledSkill {
    pub fn new(skill_id: impl Into<String>) -> Self {
        Self {
            skill_id: skill_id.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Sub-groups of one skill family, fetched a batch at a time on every
/// `every_ticks`-th tick with a rotating cursor.
pub struct FanOutGroup {
    pub group: String,
    pub members: Vec<ScheduledSkill>,
    pub every_ticks: u32,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// What the fetch scheduler keeps warm.
pub struct FetchPlan {
    pub skills: Vec<ScheduledSkill>,
    pub fan_out: Vec<FanOutGroup>,
}

impl FetchPlan {
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for skill in self
            .skills
            .iter()
            .chain(self.fan_out.iter().flat_map(|group| group.members.iter()))
        {
            if skill.skill_id.trim().is_empty() {
                bail!("scheduled skill id must be non-empty");
            }
            if !seen.insert(skill.skill_id.as_str()) {
                bail!("skill '{}' is scheduled more than once", skill.skill_id);
            }
        }
        let mut groups = BTreeSet::new();
        for group in &self.fan_out {
            if !groups.insert(group.group.as_str()) {
                bail!("fan-out group '{}' is declared more than once", group.group);
            }
            if group.every_ticks == 0 {
                bail!("fan-out group '{}' every_ticks must be greater than 0", group.group);
            }
            if group.batch_size == 0 {
                bail!("fan-out group '{}' batch_size must be greater than 0", group.group);
            }
        }
        Ok(())
    }

    pub fn skill_count(&self) -> usize {
        self.skills.len()
            + self
                .fan_out
                .iter()
                .map(|group| group.members.len())
                .sum::<usize>()
    }
}

impl FanOutGroup {
    /// Returns the members starting at `cursor`, wrapping around, and the
    /// cursor for the next batch.
    pub fn batch_at(&self, cursor: usize) -> (Vec<&ScheduledSkill>, usize) {
        if self.members.is_empty() {
            return (Vec::new(), 0);
        }
        let len = self.members.len();
        let start = cursor % len;
        let take = self.batch_size.min(len);
        let batch = (0..take)
            .map(|offset| &self.members[(start + offset) % len])
            .collect();
        (batch, (start + take) % len)
    }
}

#[cfg(test)]
mod tests {
    use super::{FanOutGroup, FetchPlan, ScheduledSkill};

    fn group(members: &[&str], batch_size: usize) -> FanOutGroup {
        FanOutGroup {
            group: "topics".to_string(),
            members: members
                .iter()
                .map(|id| ScheduledSkill::new(format!("topics:{id}")))
                .collect(),
            every_ticks: 3,
            batch_size,
        }
    }

    #[test]
    fn unit_batch_rotation_wraps_around_members() {
        let group = group(&["ai", "crypto", "health"], 2);
        let (first, cursor) = group.batch_at(0);
        assert_eq!(
            first.iter().map(|skill| skill.skill_id.as_str()).collect::<Vec<_>>(),
            vec!["topics:ai", "topics:crypto"]
        );
        assert_eq!(cursor, 2);
        let (second, cursor) = group.batch_at(cursor);
        assert_eq!(
            second.iter().map(|skill| skill.skill_id.as_str()).collect::<Vec<_>>(),
            vec!["topics:health", "topics:ai"]
        );
        assert_eq!(cursor, 1);
    }

    #[test]
    fn unit_oversized_batch_visits_each_member_once() {
        let group = group(&["ai", "crypto"], 5);
        let (batch, cursor) = group.batch_at(1);
        assert_eq!(batch.len(), 2);
        assert_eq!(cursor, 1);
    }

    #[test]
    fn regression_plan_validation_rejects_duplicates_and_zero_rates() {
        let mut plan = FetchPlan {
            skills: vec![ScheduledSkill::new("topics:ai")],
            fan_out: vec![group(&["ai"], 1)],
        };
        assert!(plan.validate().is_err());

        plan.skills = vec![ScheduledSkill::new("trending")];
        assert!(plan.validate().is_ok());
        assert_eq!(plan.skill_count(), 2);

        plan.fan_out[0].every_ticks = 0;
        assert!(plan.validate().is_err());
    }
}
