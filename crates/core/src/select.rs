//! Instance selection and per-command reactions.
//!
//! Commands hand the selector a list of names and a policy for the empty
//! list; the selector classifies every name as operative, deleted or missing
//! and folds the command's reaction table into a single aggregated status.

use std::collections::HashSet;
use tonic::{Code, Status};

use crate::registry::DaemonState;

/// What an empty name list selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceGroup {
    None,
    Operative,
    Deleted,
    All,
}

/// Classification of a single requested name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trail {
    Operative(String),
    Deleted(String),
    Missing(String),
}

impl Trail {
    pub fn name(&self) -> &str {
        match self {
            Trail::Operative(n) | Trail::Deleted(n) | Trail::Missing(n) => n,
        }
    }
}

/// Names classified into the three buckets, input order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionReport {
    pub operative: Vec<String>,
    pub deleted: Vec<String>,
    pub missing: Vec<String>,
}

/// `(status code, optional message template)` for one bucket. A template on
/// an OK code is logged at debug instead of reported.
#[derive(Debug, Clone)]
pub struct ReactionComponent {
    pub code: Code,
    pub message_template: Option<String>,
}

impl ReactionComponent {
    pub fn ok() -> Self {
        Self {
            code: Code::Ok,
            message_template: None,
        }
    }

    pub fn new(code: Code, template: &str) -> Self {
        Self {
            code,
            message_template: Some(template.to_string()),
        }
    }

    pub fn code_only(code: Code) -> Self {
        Self {
            code,
            message_template: None,
        }
    }
}

/// One command's reaction to each selection bucket.
#[derive(Debug, Clone)]
pub struct SelectionReaction {
    pub operative: ReactionComponent,
    pub deleted: ReactionComponent,
    pub missing: ReactionComponent,
}

/// Targets must be operative: deleted and missing names are errors.
pub fn require_operative_instances() -> SelectionReaction {
    SelectionReaction {
        operative: ReactionComponent::ok(),
        deleted: ReactionComponent::new(Code::InvalidArgument, "instance \"{}\" is deleted"),
        missing: ReactionComponent::new(Code::NotFound, "instance \"{}\" does not exist"),
    }
}

/// Targets must exist, deleted or not.
pub fn require_existing_instances() -> SelectionReaction {
    SelectionReaction {
        operative: ReactionComponent::ok(),
        deleted: ReactionComponent::ok(),
        missing: ReactionComponent::new(Code::NotFound, "instance \"{}\" does not exist"),
    }
}

/// Targets must not exist yet.
pub fn require_missing_instances() -> SelectionReaction {
    SelectionReaction {
        operative: ReactionComponent::new(Code::InvalidArgument, "instance \"{}\" already exists"),
        deleted: ReactionComponent::new(Code::InvalidArgument, "instance \"{}\" already exists"),
        missing: ReactionComponent::ok(),
    }
}

/// Classify one name against the live tables.
pub fn find_instance(state: &DaemonState, name: &str) -> Trail {
    if state.operative_instances.contains_key(name) {
        Trail::Operative(name.to_string())
    } else if state.deleted_instances.contains_key(name) {
        Trail::Deleted(name.to_string())
    } else {
        Trail::Missing(name.to_string())
    }
}

/// Classify a list of names. An empty list selects whole tables per
/// `no_name_means`; a non-empty list is deduplicated preserving first-seen
/// order.
pub fn select_instances<'a, I>(
    state: &DaemonState,
    names: I,
    no_name_means: InstanceGroup,
) -> SelectionReport
where
    I: IntoIterator<Item = &'a str>,
{
    let mut report = SelectionReport::default();
    let mut names = names.into_iter().peekable();

    if names.peek().is_none() && no_name_means != InstanceGroup::None {
        if matches!(no_name_means, InstanceGroup::Operative | InstanceGroup::All) {
            report.operative = state.operative_instances.keys().cloned().collect();
            report.operative.sort();
        }
        if matches!(no_name_means, InstanceGroup::Deleted | InstanceGroup::All) {
            report.deleted = state.deleted_instances.keys().cloned().collect();
            report.deleted.sort();
        }
        return report;
    }

    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.to_string()) {
            continue;
        }
        match find_instance(state, name) {
            Trail::Operative(n) => report.operative.push(n),
            Trail::Deleted(n) => report.deleted.push(n),
            Trail::Missing(n) => report.missing.push(n),
        }
    }

    report
}

fn render(template: &str, name: &str) -> String {
    template.replace("{}", name)
}

fn react_to_component(
    names: &[String],
    component: &ReactionComponent,
    errors: &mut Vec<String>,
) -> Code {
    if names.is_empty() {
        return Code::Ok;
    }

    if let Some(template) = &component.message_template {
        for name in names {
            if component.code != Code::Ok {
                errors.push(render(template, name));
            } else {
                tracing::debug!("{}", render(template, name));
            }
        }
    }

    component.code
}

/// Fold accumulated error lines and a code into the aggregate status shape
/// shared by every command.
pub fn status_for(errors: Vec<String>, mut code: Code) -> Result<(), Status> {
    if !errors.is_empty() && code == Code::Ok {
        code = Code::InvalidArgument;
    }

    if code == Code::Ok {
        Ok(())
    } else {
        Err(Status::new(
            code,
            format!("The following errors occurred:\n{}", errors.join("\n")),
        ))
    }
}

/// Apply a reaction table to a selection. The last non-OK code wins; all
/// messages are concatenated.
pub fn status_for_selection(
    report: &SelectionReport,
    reaction: &SelectionReaction,
) -> Result<(), Status> {
    let mut errors = Vec::new();
    let mut code = Code::Ok;

    for (names, component) in [
        (&report.operative, &reaction.operative),
        (&report.deleted, &reaction.deleted),
        (&report.missing, &reaction.missing),
    ] {
        let c = react_to_component(names, component, &mut errors);
        if c != Code::Ok {
            code = c;
        }
    }

    status_for(errors, code)
}

/// The single-name variant: reaction applied to one trail, message not
/// wrapped in the aggregate header.
pub fn status_for_trail(trail: &Trail, reaction: &SelectionReaction) -> Result<(), Status> {
    let (name, component) = match trail {
        Trail::Operative(n) => (n, &reaction.operative),
        Trail::Deleted(n) => (n, &reaction.deleted),
        Trail::Missing(n) => (n, &reaction.missing),
    };

    if let Some(template) = &component.message_template {
        let message = render(template, name);
        if component.code != Code::Ok {
            return Err(Status::new(component.code, message));
        }
        tracing::debug!("{}", message);
    }

    if component.code != Code::Ok {
        return Err(Status::new(component.code, String::new()));
    }
    Ok(())
}

/// Select and react in one step.
pub fn select_instances_and_react<'a, I>(
    state: &DaemonState,
    names: I,
    no_name_means: InstanceGroup,
    reaction: &SelectionReaction,
) -> (SelectionReport, Result<(), Status>)
where
    I: IntoIterator<Item = &'a str>,
{
    let report = select_instances(state, names, no_name_means);
    let status = status_for_selection(&report, reaction);
    (report, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockVirtualMachine;
    use multipassd_common::InstanceState;
    use std::sync::Arc;

    fn state_with(operative: &[&str], deleted: &[&str]) -> DaemonState {
        let mut state = DaemonState::default();
        for name in operative {
            state.operative_instances.insert(
                name.to_string(),
                Arc::new(MockVirtualMachine::new(name, InstanceState::Off)),
            );
        }
        for name in deleted {
            state.deleted_instances.insert(
                name.to_string(),
                Arc::new(MockVirtualMachine::new(name, InstanceState::Stopped)),
            );
        }
        state
    }

    #[test]
    fn test_classifies_each_name_into_one_bucket() {
        let state = state_with(&["alive"], &["gone"]);
        let report = select_instances(
            &state,
            ["alive", "gone", "nowhere"],
            InstanceGroup::None,
        );
        assert_eq!(report.operative, vec!["alive"]);
        assert_eq!(report.deleted, vec!["gone"]);
        assert_eq!(report.missing, vec!["nowhere"]);
    }

    #[test]
    fn test_deduplicates_preserving_first_seen_order() {
        let state = state_with(&["a", "b"], &[]);
        let report = select_instances(&state, ["b", "a", "b", "a"], InstanceGroup::None);
        assert_eq!(report.operative, vec!["b", "a"]);
    }

    #[test]
    fn test_empty_input_selects_per_policy() {
        let state = state_with(&["a"], &["z"]);

        let all = select_instances(&state, Vec::<&str>::new(), InstanceGroup::All);
        assert_eq!(all.operative, vec!["a"]);
        assert_eq!(all.deleted, vec!["z"]);

        let none = select_instances(&state, Vec::<&str>::new(), InstanceGroup::None);
        assert!(none.operative.is_empty() && none.deleted.is_empty());

        let deleted = select_instances(&state, Vec::<&str>::new(), InstanceGroup::Deleted);
        assert!(deleted.operative.is_empty());
        assert_eq!(deleted.deleted, vec!["z"]);
    }

    #[test]
    fn test_require_operative_reports_deleted_and_missing() {
        let state = state_with(&["a"], &["z"]);
        let (_, status) = select_instances_and_react(
            &state,
            ["a", "z", "nope"],
            InstanceGroup::None,
            &require_operative_instances(),
        );
        let err = status.unwrap_err();
        // Last non-OK code wins: missing is visited after deleted.
        assert_eq!(err.code(), Code::NotFound);
        let message = err.message();
        assert!(message.starts_with("The following errors occurred:\n"));
        assert!(message.contains("instance \"z\" is deleted"));
        assert!(message.contains("instance \"nope\" does not exist"));
    }

    #[test]
    fn test_require_missing_rejects_existing() {
        let state = state_with(&["a"], &[]);
        let trail = find_instance(&state, "a");
        let err = status_for_trail(&trail, &require_missing_instances()).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "instance \"a\" already exists");
    }

    #[test]
    fn test_ok_with_template_stays_ok() {
        let state = state_with(&["a"], &[]);
        let mut reaction = require_existing_instances();
        reaction.operative =
            ReactionComponent::new(Code::Ok, "instance \"{}\" does not need to be recovered");
        let (_, status) =
            select_instances_and_react(&state, ["a"], InstanceGroup::None, &reaction);
        assert!(status.is_ok());
    }

    #[test]
    fn test_status_for_upgrades_errors_without_code() {
        let err = status_for(vec!["boom".into()], Code::Ok).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
