use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct NoteArgs {
    /// Note title
    #[clap(short, long)]
    pub title: Option<String>,

    /// Note body
    #[clap(short = 'b', long)]
    pub content: Option<String>,

    /// Comma separated tags
    #[clap(short = 'g', long)]
    pub tags: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Print the active configuration
    Show {},

    /// Recommend an index for a dataset size (defaults to the stored count)
    Recommend {
        #[clap(short, long)]
        size: Option<usize>,

        /// Apply the recommendation and save it to config.yaml
        #[clap(long, default_value = "false")]
        apply: bool,
    },

    /// Set a dotted key, e.g. `cache.max_size 500`
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum SqlAction {
    /// CREATE INDEX statement for the active config
    Index {},

    /// Session setting for the search-time index knob
    Session {},

    /// Ranked search statement with its bound parameters
    Search {
        /// Comma separated query vector
        #[clap(allow_hyphen_values = true)]
        vector: String,

        #[clap(short, long, default_value = "10")]
        limit: usize,

        #[clap(long, default_value = "0")]
        threshold: f32,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the content row a vector can be attached to
    Register {
        id: String,

        #[clap(flatten)]
        note: NoteArgs,
    },

    /// Store (or overwrite) the vector of a registered note
    Store {
        id: String,

        /// Comma separated vector
        #[clap(allow_hyphen_values = true)]
        vector: String,
    },

    /// Clear the vector of a note
    Delete { id: String },

    /// Print the stored vector record
    Get { id: String },

    /// Embed the note's title and body with the configured provider
    Embed {
        id: String,

        #[clap(short, long)]
        title: Option<String>,

        #[clap(short = 'b', long)]
        content: Option<String>,
    },

    /// Nearest-neighbour search by vector or by text
    Search {
        /// Comma separated query vector
        #[clap(long, allow_hyphen_values = true, conflicts_with = "text")]
        vector: Option<String>,

        /// Text to embed as the query
        #[clap(long)]
        text: Option<String>,

        #[clap(short, long, default_value = "10")]
        limit: usize,

        #[clap(long, default_value = "0")]
        threshold: f32,

        /// Metadata filter `key=value`, repeatable
        #[clap(short, long)]
        filter: Vec<String>,

        /// Omit metadata from results
        #[clap(long, default_value = "false")]
        no_metadata: bool,
    },

    /// Keyword + vector search
    Hybrid {
        text: String,

        /// Comma separated query vector (embeds `text` if omitted)
        #[clap(long, allow_hyphen_values = true)]
        vector: Option<String>,

        #[clap(long)]
        keyword_weight: Option<f32>,

        #[clap(long)]
        vector_weight: Option<f32>,

        #[clap(short, long, default_value = "10")]
        limit: usize,

        /// Use reciprocal rank fusion instead of weighted scores
        #[clap(long, default_value = "false")]
        rrf: bool,
    },

    /// Inspect or change the configuration
    Config {
        #[clap(subcommand)]
        action: ConfigAction,
    },

    /// Print backing-store statements
    Sql {
        #[clap(subcommand)]
        action: SqlAction,
    },

    /// Cache and store statistics
    Stats {},
}
