use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "termpilot",
    about = "Drive an agent session in a terminal pane toward a goal",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List terminal surfaces and any stored autopilot session
    List {
        /// Include surfaces that do not look like agent sessions
        #[arg(long)]
        all: bool,
    },

    /// Show the classified status of a surface
    Status {
        /// Surface id (tmux pane id such as %3)
        surface: String,
    },

    /// Show the last response and recent exchanges of a surface
    Context {
        surface: String,

        /// Parse the full scrollback instead of the visible screen
        #[arg(long)]
        full: bool,
    },

    /// Attach to a surface and run the autopilot loop on it
    Attach {
        surface: String,

        /// Goal for a new session
        #[arg(long)]
        goal: Option<String>,

        /// Resume the stored session without asking
        #[arg(long, conflicts_with = "new")]
        resume: bool,

        /// Start a new session even if one is stored
        #[arg(long)]
        new: bool,
    },

    /// Pick a surface and a goal interactively, then run the loop
    Run,

    /// List stored autopilot sessions
    Sessions,

    /// Show effective configuration
    Config {
        /// Emit machine-readable JSON output
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attach_with_goal() {
        let cli = Cli::try_parse_from(["termpilot", "attach", "%3", "--goal", "write a haiku"])
            .unwrap();
        match cli.command {
            Command::Attach {
                surface,
                goal,
                resume,
                new,
            } => {
                assert_eq!(surface, "%3");
                assert_eq!(goal.as_deref(), Some("write a haiku"));
                assert!(!resume);
                assert!(!new);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn resume_and_new_conflict() {
        let result = Cli::try_parse_from(["termpilot", "attach", "7", "--resume", "--new"]);
        assert!(result.is_err());
    }

    #[test]
    fn verbosity_is_global() {
        let cli = Cli::try_parse_from(["termpilot", "status", "%1", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn parses_context_full_and_completions() {
        let cli = Cli::try_parse_from(["termpilot", "context", "%2", "--full"]).unwrap();
        assert!(matches!(cli.command, Command::Context { full: true, .. }));

        let cli = Cli::try_parse_from(["termpilot", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Completions {
                shell: CompletionShell::Zsh
            }
        ));
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
