use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "funnelgram")]
#[command(author, version, about = "Telegram funnel progression engine and broadcast dispatcher", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run both engines (funnel progression + broadcast dispatch)
    Run,

    /// Create the database schema and exit
    InitDb,

    /// Create a project row (prints the new project id)
    AddProject {
        /// Project display name
        #[arg(short, long)]
        name: String,

        /// Bot API token for this project's audience
        #[arg(short, long)]
        token: String,

        /// Chat id to notify on operational problems
        #[arg(long)]
        admin: Option<i64>,
    },

    /// Enroll a subscriber at funnel position 0 (manual testing aid)
    Enroll {
        /// Project the subscriber belongs to
        #[arg(short, long)]
        project: i64,

        /// Telegram chat id of the subscriber
        #[arg(short, long)]
        chat: i64,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
