//! Fixed target schema for every entity type the two upstream services emit.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FieldType::{self, *};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Clockify,
    Linear,
}

impl Source {
    /// Also the PostgreSQL schema the source's tables live in.
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Clockify => "clockify",
            Source::Linear => "linear",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub field_type: FieldType,
}

const fn col(name: &'static str, field_type: FieldType) -> ColumnDef {
    ColumnDef { name, field_type }
}

/// An inline collection of references that becomes a junction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JunctionDef {
    /// Relation name of the junction table.
    pub table: &'static str,
    /// Flattened storage key holding the list of references.
    pub collection: &'static str,
    /// Every flattened key equal to or below this prefix is removed from the parent record.
    pub strip: &'static str,
    /// Raw key carrying the referenced id inside each list element.
    pub element_key: &'static str,
    pub parent_column: &'static str,
    pub parent_table: &'static str,
    pub child_column: &'static str,
    pub child_table: &'static str,
}

impl JunctionDef {
    pub fn key_columns(&self) -> [&'static str; 2] {
        [self.parent_column, self.child_column]
    }
}

#[derive(Debug)]
pub struct EntitySchema {
    pub kind: EntityKind,
    pub columns: &'static [ColumnDef],
    /// Column order is part of the contract: unknown or absent columns are fatal.
    pub ordered: bool,
    /// Substring rewrites applied to the raw joined key before renaming.
    pub key_rewrites: &'static [(&'static str, &'static str)],
    /// Known upstream columns (and their sub-keys) that are not persisted.
    pub discarded: &'static [&'static str],
    pub junctions: &'static [JunctionDef],
}

impl EntitySchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns.iter().map(|c| c.name)
    }

    /// True when some column lives underneath `prefix` (`assignee` for `assignee_id`).
    pub fn has_columns_under(&self, prefix: &str) -> bool {
        self.columns_under(prefix).next().is_some()
    }

    pub fn columns_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a ColumnDef> + 'a {
        self.columns.iter().filter(move |c| {
            c.name.len() > prefix.len()
                && c.name.starts_with(prefix)
                && c.name.as_bytes()[prefix.len()] == b'_'
        })
    }

    pub fn is_discarded(&self, key: &str) -> bool {
        self.discarded.iter().any(|d| key_is_under(key, d))
    }

    pub fn junction_for(&self, key: &str) -> Option<&JunctionDef> {
        self.junctions.iter().find(|j| key_is_under(key, j.strip))
    }
}

/// `key == prefix` or `key` starts with `prefix_`.
pub fn key_is_under(key: &str, prefix: &str) -> bool {
    key == prefix
        || (key.len() > prefix.len()
            && key.starts_with(prefix)
            && key.as_bytes()[prefix.len()] == b'_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityKind {
    ClockifyClients,
    ClockifyUsers,
    ClockifyProjects,
    ClockifyTasks,
    ClockifyTimeEntries,
    LinearUsers,
    LinearTeams,
    LinearProjects,
    LinearIssues,
    LinearCycles,
    LinearCustomers,
}

impl EntityKind {
    /// Parents before the entities whose junction tables reference them.
    pub const ALL: [EntityKind; 11] = [
        EntityKind::ClockifyClients,
        EntityKind::ClockifyUsers,
        EntityKind::ClockifyProjects,
        EntityKind::ClockifyTasks,
        EntityKind::ClockifyTimeEntries,
        EntityKind::LinearUsers,
        EntityKind::LinearTeams,
        EntityKind::LinearProjects,
        EntityKind::LinearIssues,
        EntityKind::LinearCycles,
        EntityKind::LinearCustomers,
    ];

    pub fn source(self) -> Source {
        match self {
            EntityKind::ClockifyClients
            | EntityKind::ClockifyUsers
            | EntityKind::ClockifyProjects
            | EntityKind::ClockifyTasks
            | EntityKind::ClockifyTimeEntries => Source::Clockify,
            _ => Source::Linear,
        }
    }

    pub fn relation_name(self) -> &'static str {
        match self {
            EntityKind::ClockifyClients => "clockify.clients",
            EntityKind::ClockifyUsers => "clockify.users",
            EntityKind::ClockifyProjects => "clockify.projects",
            EntityKind::ClockifyTasks => "clockify.tasks",
            EntityKind::ClockifyTimeEntries => "clockify.time_entries",
            EntityKind::LinearUsers => "linear.users",
            EntityKind::LinearTeams => "linear.teams",
            EntityKind::LinearProjects => "linear.projects",
            EntityKind::LinearIssues => "linear.issues",
            EntityKind::LinearCycles => "linear.cycles",
            EntityKind::LinearCustomers => "linear.customers",
        }
    }

    /// Table name without the source schema.
    pub fn table(self) -> &'static str {
        let name = self.relation_name();
        name.split_once('.').map(|(_, t)| t).unwrap_or(name)
    }

    pub fn schema(self) -> &'static EntitySchema {
        match self {
            EntityKind::ClockifyClients => &CLOCKIFY_CLIENTS,
            EntityKind::ClockifyUsers => &CLOCKIFY_USERS,
            EntityKind::ClockifyProjects => &CLOCKIFY_PROJECTS,
            EntityKind::ClockifyTasks => &CLOCKIFY_TASKS,
            EntityKind::ClockifyTimeEntries => &CLOCKIFY_TIME_ENTRIES,
            EntityKind::LinearUsers => &LINEAR_USERS,
            EntityKind::LinearTeams => &LINEAR_TEAMS,
            EntityKind::LinearProjects => &LINEAR_PROJECTS,
            EntityKind::LinearIssues => &LINEAR_ISSUES,
            EntityKind::LinearCycles => &LINEAR_CYCLES,
            EntityKind::LinearCustomers => &LINEAR_CUSTOMERS,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relation_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEntityKindError(pub String);

impl fmt::Display for ParseEntityKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown entity `{}`", self.0)
    }
}

impl std::error::Error for ParseEntityKindError {}

impl FromStr for EntityKind {
    type Err = ParseEntityKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.relation_name() == s)
            .ok_or_else(|| ParseEntityKindError(s.to_string()))
    }
}

impl TryFrom<String> for EntityKind {
    type Error = ParseEntityKindError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityKind> for String {
    fn from(kind: EntityKind) -> Self {
        kind.relation_name().to_string()
    }
}

/// Every junction table across the catalog, in entity order.
pub fn all_junctions() -> impl Iterator<Item = &'static JunctionDef> {
    EntityKind::ALL
        .into_iter()
        .flat_map(|k| k.schema().junctions.iter())
}

static CLOCKIFY_CLIENTS: EntitySchema = EntitySchema {
    kind: EntityKind::ClockifyClients,
    columns: &[
        col("id", Identifier),
        col("name", Text),
        col("email", Text),
        col("workspace_id", Identifier),
        col("archived", Boolean),
        col("address", Text),
        col("note", Text),
        col("currency_id", Identifier),
        col("currency_code", Text),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[],
};

static CLOCKIFY_USERS: EntitySchema = EntitySchema {
    kind: EntityKind::ClockifyUsers,
    columns: &[
        col("id", Identifier),
        col("email", Text),
        col("name", Text),
        col("memberships", StringList),
        col("profile_picture", Text),
        col("active_workspace", Identifier),
        col("default_workspace", Identifier),
        col("status", Text),
        col("custom_fields", StringList),
        col("week_start", Text),
        col("time_zone", Text),
        col("time_format", Text),
        col("date_format", Text),
        col("send_newsletter", Boolean),
        col("weekly_updates", Boolean),
        col("long_running", Boolean),
        col("scheduled_reports", Boolean),
        col("approval", Boolean),
        col("pto", Boolean),
        col("alerts", Boolean),
        col("reminders", Boolean),
        col("time_tracking_manual", Boolean),
        col("summary_group", Text),
        col("summary_subgroup", Text),
        col("is_compact_view_on", Boolean),
        col("dashboard_selection", Text),
        col("dashboard_view_type", Text),
        col("dashboard_pin_to_top", Boolean),
        col("project_list_collapse", Integer),
        col("collapse_all_project_lists", Boolean),
        col("group_similar_entries_disabled", Boolean),
        col("my_start_of_day", Text),
        col("project_picker_task_filter", Boolean),
        col("lang", Text),
        col("multi_factor_enabled", Boolean),
        col("theme", Text),
        col("scheduling", Boolean),
        col("onboarding", Boolean),
        col("show_only_working_days", Boolean),
    ],
    ordered: false,
    key_rewrites: &[("settings_", ""), ("ReportSettings", "")],
    discarded: &[],
    junctions: &[],
};

static CLOCKIFY_PROJECTS: EntitySchema = EntitySchema {
    kind: EntityKind::ClockifyProjects,
    columns: &[
        col("id", Identifier),
        col("name", Text),
        col("client_id", Identifier),
        col("workspace_id", Identifier),
        col("billable", Boolean),
        col("color", Text),
        col("archived", Boolean),
        col("duration", Duration),
        col("client_name", Text),
        col("note", Text),
        col("template", Boolean),
        col("public", Boolean),
        col("hourly_rate_amount", Float),
        col("hourly_rate_currency", Text),
        col("cost_rate_amount", Float),
        col("cost_rate_currency", Text),
        col("budget_estimate", Float),
        col("estimate_reset", Float),
        col("estimate_estimate", Duration),
        col("estimate_type", Text),
        col("time_estimate_estimate", Duration),
        col("time_estimate_type", Text),
        col("time_estimate_reset_option", Text),
        col("time_estimate_active", Boolean),
        col("time_estimate_include_non_billable", Boolean),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[JunctionDef {
        table: "clockify.project_memberships",
        collection: "memberships",
        strip: "memberships",
        element_key: "userId",
        parent_column: "project_id",
        parent_table: "clockify.projects",
        child_column: "user_id",
        child_table: "clockify.users",
    }],
};

static CLOCKIFY_TASKS: EntitySchema = EntitySchema {
    kind: EntityKind::ClockifyTasks,
    columns: &[
        col("id", Identifier),
        col("name", Text),
        col("project_id", Identifier),
        col("assignee_ids", StringList),
        col("assignee_id", Identifier),
        col("user_group_ids", StringList),
        col("estimate", Duration),
        col("status", Text),
        col("budget_estimate", Float),
        col("duration", Duration),
        col("billable", Boolean),
        col("hourly_rate_amount", Float),
        col("hourly_rate_currency", Text),
        col("cost_rate_amount", Float),
        col("cost_rate_currency", Text),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[],
};

static CLOCKIFY_TIME_ENTRIES: EntitySchema = EntitySchema {
    kind: EntityKind::ClockifyTimeEntries,
    columns: &[
        col("id", Identifier),
        col("description", Text),
        col("tag_ids", StringList),
        col("user_id", Identifier),
        col("billable", Boolean),
        col("task_id", Identifier),
        col("project_id", Identifier),
        col("workspace_id", Identifier),
        col("custom_field_values", StringList),
        col("type", Text),
        col("kiosk_id", Identifier),
        col("is_locked", Boolean),
        col("time_interval_start", Timestamp),
        col("time_interval_end", Timestamp),
        col("time_interval_duration", Duration),
        col("hourly_rate_amount", Float),
        col("hourly_rate_currency", Text),
        col("cost_rate_amount", Float),
        col("cost_rate_currency", Text),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[],
};

static LINEAR_USERS: EntitySchema = EntitySchema {
    kind: EntityKind::LinearUsers,
    columns: &[
        col("id", Identifier),
        col("name", Text),
        col("email", Text),
        col("description", Text),
        col("active", Boolean),
        col("admin", Boolean),
        col("timezone", Text),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
        col("archived_at", Timestamp),
        col("status_label", Text),
        col("status_until_at", Timestamp),
        col("initials", Text),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[],
};

static LINEAR_TEAMS: EntitySchema = EntitySchema {
    kind: EntityKind::LinearTeams,
    columns: &[
        col("id", Identifier),
        col("name", Text),
        col("description", Text),
        col("timezone", Text),
        col("key", Text),
        col("cycle_start_day", Integer),
        col("created_at", Timestamp),
        col("archived_at", Timestamp),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[JunctionDef {
        table: "linear.team_members",
        collection: "members_nodes",
        strip: "members",
        element_key: "id",
        parent_column: "team_id",
        parent_table: "linear.teams",
        child_column: "user_id",
        child_table: "linear.users",
    }],
};

static LINEAR_PROJECTS: EntitySchema = EntitySchema {
    kind: EntityKind::LinearProjects,
    columns: &[
        col("id", Identifier),
        col("creator_id", Identifier),
        col("name", Text),
        col("scope", Float),
        col("start_date", Timestamp),
        col("started_at", Timestamp),
        col("created_at", Timestamp),
        col("completed_at", Timestamp),
        col("lead_id", Identifier),
        col("description", Text),
        col("priority", Integer),
        col("status_type", Text),
    ],
    ordered: true,
    key_rewrites: &[],
    discarded: &["creator_name", "lead_name"],
    junctions: &[JunctionDef {
        table: "linear.team_projects",
        collection: "teams_nodes",
        strip: "teams",
        element_key: "id",
        parent_column: "project_id",
        parent_table: "linear.projects",
        child_column: "team_id",
        child_table: "linear.teams",
    }],
};

static LINEAR_ISSUES: EntitySchema = EntitySchema {
    kind: EntityKind::LinearIssues,
    columns: &[
        col("id", Identifier),
        col("title", Text),
        col("description", Text),
        col("priority", Integer),
        col("estimate", Float),
        col("assignee_id", Identifier),
        col("creator_id", Identifier),
        col("project_id", Identifier),
        col("team_id", Identifier),
        col("supervisor_id", Identifier),
        col("delegate_id", Identifier),
        col("snoozed_by_id", Identifier),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
        col("started_at", Timestamp),
        col("completed_at", Timestamp),
        col("due_date", Timestamp),
        col("triaged_at", Timestamp),
        col("started_triage_at", Timestamp),
        col("canceled_at", Timestamp),
        col("snoozed_until_at", Timestamp),
        col("added_to_cycle_at", Timestamp),
        col("added_to_project_at", Timestamp),
        col("added_to_team_at", Timestamp),
    ],
    ordered: true,
    key_rewrites: &[],
    discarded: &["needs", "activity_summary"],
    junctions: &[],
};

static LINEAR_CYCLES: EntitySchema = EntitySchema {
    kind: EntityKind::LinearCycles,
    columns: &[
        col("id", Identifier),
        col("name", Text),
        col("description", Text),
        col("number", Integer),
        col("is_active", Boolean),
        col("progress", Float),
        col("progress_history", StringList),
        col("scope_history", StringList),
        col("starts_at", Timestamp),
        col("ends_at", Timestamp),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
        col("completed_at", Timestamp),
        col("auto_archived_at", Timestamp),
        col("archived_at", Timestamp),
        col("team_id", Identifier),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[JunctionDef {
        table: "linear.cycle_issues",
        collection: "issues_nodes",
        strip: "issues",
        element_key: "id",
        parent_column: "cycle_id",
        parent_table: "linear.cycles",
        child_column: "issue_id",
        child_table: "linear.issues",
    }],
};

static LINEAR_CUSTOMERS: EntitySchema = EntitySchema {
    kind: EntityKind::LinearCustomers,
    columns: &[
        col("id", Identifier),
        col("name", Text),
        col("owner_id", Identifier),
        col("status_id", Identifier),
        col("tier_id", Identifier),
        col("revenue", Float),
        col("size", Float),
        col("created_at", Timestamp),
        col("updated_at", Timestamp),
        col("archived_at", Timestamp),
        col("main_source_id", Identifier),
    ],
    ordered: false,
    key_rewrites: &[],
    discarded: &[],
    junctions: &[],
};
