//! CLI argument definitions using clap derive API

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::CliConfig;
use crate::migrations::Template;

/// Apply SQL migration files exactly once, with checksum drift detection
#[derive(Parser, Debug)]
#[command(name = "mdh-migrate")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute (default: up)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Arguments available to all commands
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Database URL (postgres://... or sqlite:...)
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Migrations directory [default: migrations]
    #[arg(short, long, global = true, env = "MIGRATIONS_DIR")]
    pub dir: Option<PathBuf>,

    /// Schema holding the tracking table [default: system]
    #[arg(long, global = true)]
    pub schema: Option<String>,

    /// Tracking table name [default: schema_migrations]
    #[arg(long, global = true)]
    pub table: Option<String>,

    /// Config file (default: ./mdh-migrate.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Environment name, overrides APP_ENV / NODE_ENV
    #[arg(long = "env", global = true)]
    pub environment: Option<String>,

    /// Do not take the advisory lock during `up`
    #[arg(long, global = true)]
    pub no_lock: bool,

    /// Log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalArgs {
    pub fn to_cli_config(&self) -> CliConfig {
        CliConfig {
            database_url: self.database_url.clone(),
            migrations_dir: self.dir.clone(),
            schema: self.schema.clone(),
            table: self.table.clone(),
            environment: self.environment.clone(),
            no_lock: self.no_lock,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Apply pending migrations
    Up,

    /// Show applied, pending and drifted migrations
    #[command(alias = "list")]
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Scaffold a new migration and its .down.sql
    Create(CreateArgs),

    /// Delete every tracking record (refused in production)
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show the rollback SQL for the latest migration, or run it
    Down {
        /// Execute the rollback SQL and delete the record (refused in production)
        #[arg(long)]
        execute: bool,

        /// Skip the confirmation prompt for --execute
        #[arg(long, requires = "execute")]
        yes: bool,

        /// List the most recent records instead
        #[arg(long, conflicts_with = "execute")]
        list: bool,
    },

    /// Show what `up` would do without executing anything
    Plan,
}

/// Template kinds for `create`
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateKind {
    #[default]
    Generic,
    Table,
    Column,
    Index,
    Data,
    Constraint,
}

/// Arguments for the create command
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct CreateArgs {
    /// Human-readable description, slugged into the filename
    pub description: String,

    #[arg(short, long, value_enum, default_value = "generic")]
    pub template: TemplateKind,

    /// Table the template acts on (table, column, index, constraint)
    #[arg(long)]
    pub target: Option<String>,

    /// Column name (column)
    #[arg(long)]
    pub column: Option<String>,

    /// Column type (column) [default: VARCHAR(255)]
    #[arg(long)]
    pub column_type: Option<String>,

    /// Index name (index)
    #[arg(long)]
    pub index: Option<String>,

    /// Indexed columns (index) [default: id]
    #[arg(long)]
    pub columns: Option<String>,

    /// Constraint name (constraint)
    #[arg(long)]
    pub constraint: Option<String>,

    /// Constraint definition (constraint) [default: CHECK (id > 0)]
    #[arg(long)]
    pub definition: Option<String>,
}

impl CreateArgs {
    /// Build the template, naming the first missing required argument.
    pub fn template(&self) -> Result<Template, String> {
        let kind = format!("{:?}", self.template).to_lowercase();
        let required = |value: &Option<String>, flag: &str| {
            value
                .clone()
                .ok_or_else(|| format!("--{} is required for the {} template", flag, kind))
        };

        Ok(match self.template {
            TemplateKind::Generic => Template::Generic,
            TemplateKind::Data => Template::Data,
            TemplateKind::Table => Template::Table {
                table: required(&self.target, "target")?,
            },
            TemplateKind::Column => Template::Column {
                table: required(&self.target, "target")?,
                column: required(&self.column, "column")?,
                column_type: self.column_type.clone(),
            },
            TemplateKind::Index => Template::Index {
                table: required(&self.target, "target")?,
                index: required(&self.index, "index")?,
                columns: self.columns.clone(),
            },
            TemplateKind::Constraint => Template::Constraint {
                table: required(&self.target, "target")?,
                name: required(&self.constraint, "constraint")?,
                definition: self.definition.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mdh-migrate").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_no_subcommand_means_up() {
        let cli = parse(&[]);
        assert_eq!(cli.command, None);
        assert!(!cli.global.no_lock);
    }

    #[test]
    fn test_list_alias_and_global_flags() {
        let cli = parse(&["list", "--json", "--schema", "ops", "-vv", "--no-lock"]);
        assert_eq!(cli.command, Some(Command::Status { json: true }));
        assert_eq!(cli.global.schema.as_deref(), Some("ops"));
        assert_eq!(cli.global.verbose, 2);
        assert!(cli.global.to_cli_config().no_lock);
    }

    #[test]
    fn test_create_column_template() {
        let cli = parse(&[
            "create",
            "add phone to users",
            "--template",
            "column",
            "--target",
            "users",
            "--column",
            "phone",
            "--column-type",
            "VARCHAR(20)",
        ]);
        let Some(Command::Create(args)) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(
            args.template().unwrap(),
            Template::Column {
                table: "users".to_string(),
                column: "phone".to_string(),
                column_type: Some("VARCHAR(20)".to_string()),
            }
        );
    }

    #[test]
    fn test_create_missing_required_argument() {
        let cli = parse(&["create", "add index", "-t", "index", "--target", "users"]);
        let Some(Command::Create(args)) = cli.command else {
            panic!("expected create");
        };
        let err = args.template().unwrap_err();
        assert!(err.contains("--index"));
    }

    #[test]
    fn test_reset_requires_nothing_but_accepts_yes() {
        assert_eq!(parse(&["reset"]).command, Some(Command::Reset { yes: false }));
        assert_eq!(parse(&["reset", "--yes"]).command, Some(Command::Reset { yes: true }));
    }

    #[test]
    fn test_down_is_inspection_unless_execute() {
        assert_eq!(
            parse(&["down"]).command,
            Some(Command::Down {
                execute: false,
                yes: false,
                list: false,
            })
        );
        assert_eq!(
            parse(&["down", "--execute", "--yes"]).command,
            Some(Command::Down {
                execute: true,
                yes: true,
                list: false,
            })
        );
    }

    #[test]
    fn test_down_flag_conflicts() {
        let parse_err = |args: &[&str]| {
            Cli::try_parse_from(std::iter::once("mdh-migrate").chain(args.iter().copied())).is_err()
        };
        assert!(parse_err(&["down", "--yes"]));
        assert!(parse_err(&["down", "--list", "--execute"]));
    }
}
