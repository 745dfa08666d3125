//! Grammars the coding tool is asked to answer in.
//!
//! Parsers tolerate prose around the tags and whitespace inside them, but a
//! tag must have exactly three `|`-separated fields. Subject and description
//! may contain brackets (`items[0]`, `#[derive(Debug)]`); only the model
//! field ends at the first `]`.

use super::model::ModelTier;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const MAX_SUBTASKS: usize = 8;

pub const ALREADY_DONE_TAG: &str = "[ALREADY_DONE]";
pub const OK_TAG: &str = "[OK]";

/// Phrases that count as "already done" when the response carries no tags.
const ALREADY_DONE_PHRASES: &[&str] = &[
    "already done",
    "already implemented",
    "no changes needed",
    "no changes required",
    "already exists",
    "already present",
];

static TASK_TAG: LazyLock<Regex> = LazyLock::new(|| tag_regex("TASK"));
static ISSUE_TAG: LazyLock<Regex> = LazyLock::new(|| tag_regex("ISSUE"));
static IMPROVE_TAG: LazyLock<Regex> = LazyLock::new(|| tag_regex("IMPROVE"));

fn tag_regex(name: &str) -> Regex {
    Regex::new(&format!(r"\[{name}:([^|]+)\|([^|]+)\|([^|\]]+)\]"))
        .expect("tag pattern is a valid regex")
}

/// One unit of work proposed by the planner, the reviewer or the assessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub subject: String,
    pub description: String,
    pub model: ModelTier,
}

fn extract(re: &Regex, response: &str) -> Vec<SubtaskSpec> {
    re.captures_iter(response)
        .map(|caps| SubtaskSpec {
            subject: caps[1].trim().to_string(),
            description: caps[2].trim().to_string(),
            model: ModelTier::parse_lenient(&caps[3]),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanResponse {
    Subtasks(Vec<SubtaskSpec>),
    AlreadyDone,
    Unparseable,
}

pub fn parse_plan(response: &str) -> PlanResponse {
    if response.contains(ALREADY_DONE_TAG) {
        return PlanResponse::AlreadyDone;
    }

    let mut subtasks = extract(&TASK_TAG, response);
    if subtasks.is_empty() {
        let lower = response.to_lowercase();
        if ALREADY_DONE_PHRASES.iter().any(|p| lower.contains(p)) {
            return PlanResponse::AlreadyDone;
        }
        return PlanResponse::Unparseable;
    }

    if subtasks.len() > MAX_SUBTASKS {
        tracing::warn!(
            proposed = subtasks.len(),
            kept = MAX_SUBTASKS,
            "plan capped"
        );
        subtasks.truncate(MAX_SUBTASKS);
    }
    PlanResponse::Subtasks(subtasks)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewResponse {
    Clean,
    Issues(Vec<SubtaskSpec>),
    Unparseable,
}

pub fn parse_review(response: &str) -> ReviewResponse {
    if response.contains(OK_TAG) {
        return ReviewResponse::Clean;
    }
    let issues = extract(&ISSUE_TAG, response);
    if issues.is_empty() {
        ReviewResponse::Unparseable
    } else {
        ReviewResponse::Issues(issues)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssessResponse {
    Healthy,
    Improve(SubtaskSpec),
    Unparseable,
}

/// Only the first `[IMPROVE:...]` tag is used.
pub fn parse_assessment(response: &str) -> AssessResponse {
    if response.contains(OK_TAG) {
        return AssessResponse::Healthy;
    }
    extract(&IMPROVE_TAG, response)
        .into_iter()
        .next()
        .map_or(AssessResponse::Unparseable, AssessResponse::Improve)
}
