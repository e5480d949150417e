use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use relmap_engine::conf::{LineFormat, Wrapping};

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// XML configuration document
    #[arg(long, global = true)]
    pub conf: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the layers and fields derived from schemas, as JSON
    Analyze {
        #[command(flatten)]
        schemas: SchemaArgs,

        /// Write the description to a file instead of the standard output
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Map a document into tables, saved as a JSON dump
    Read {
        /// The document to read
        input: PathBuf,

        /// Where to save the tables
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        schemas: SchemaArgs,

        /// Report content that does not conform to the schemas
        #[arg(long)]
        validate: bool,

        /// Stop at the first validation error
        #[arg(long, requires = "validate")]
        fail_if_error: bool,

        /// Drop the layers and fields the document does not use
        #[arg(long)]
        remove_unused: bool,
    },

    /// Rebuild a document from a JSON dump of tables
    Write {
        /// The tables saved by `read`
        input: PathBuf,

        /// The document to write
        #[arg(short, long)]
        output: PathBuf,

        /// Number of spaces per nesting level, at most 8
        #[arg(long)]
        indentation: Option<usize>,

        #[arg(long, value_enum)]
        wrapping: Option<WrappingArg>,

        #[arg(long, value_enum)]
        line_format: Option<LineFormatArg>,

        /// Comment written after the opening tag of the collection
        #[arg(long)]
        comment: Option<String>,
    },
}

#[derive(Args)]
pub struct SchemaArgs {
    /// Schema location, as `location` or `namespace=location`. Defaults to the schemas named by
    /// the document for `read`
    #[arg(long = "xsd", value_name = "LOCATION")]
    pub xsd: Vec<String>,

    /// Do not download remote schemas
    #[arg(long)]
    pub offline: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum WrappingArg {
    /// wfs:FeatureCollection
    Wfs2,
    /// relmap:FeatureCollection, with a companion schema
    Relmap,
}

impl From<WrappingArg> for Wrapping {
    fn from(arg: WrappingArg) -> Self {
        match arg {
            WrappingArg::Wfs2 => Wrapping::Wfs2FeatureCollection,
            WrappingArg::Relmap => Wrapping::GmlasFeatureCollection,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LineFormatArg {
    Native,
    Lf,
    Crlf,
}

impl From<LineFormatArg> for LineFormat {
    fn from(arg: LineFormatArg) -> Self {
        match arg {
            LineFormatArg::Native => LineFormat::Native,
            LineFormatArg::Lf => LineFormat::Lf,
            LineFormatArg::Crlf => LineFormat::CrLf,
        }
    }
}
