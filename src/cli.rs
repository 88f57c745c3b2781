use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::scores::{LayoutHint, LayoutVariant};
use crate::services::ollama::DEFAULT_OLLAMA_URL;
use crate::services::render::DEFAULT_RENDER_DPI;

#[derive(Parser, Debug)]
#[command(
    name = "gradescan",
    version,
    about = "Score extraction and trend summaries for transcribed grade reports"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Extract(ExtractArgs),
    Parse(ParseArgs),
    Report(ReportArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum LayoutArg {
    Auto,
    RoundFirst,
    DateFirst,
}

impl LayoutArg {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::RoundFirst => "round-first",
            Self::DateFirst => "date-first",
        }
    }

    pub fn hint(self) -> LayoutHint {
        match self {
            Self::Auto => LayoutHint::Auto,
            Self::RoundFirst => LayoutHint::Declared(LayoutVariant::RoundFirst),
            Self::DateFirst => LayoutHint::Declared(LayoutVariant::DateFirst),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum TranscriberKind {
    Tesseract,
    Ollama,
    TextFile,
    None,
}

impl TranscriberKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tesseract => "tesseract",
            Self::Ollama => "ollama",
            Self::TextFile => "text-file",
            Self::None => "none",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ExtractorKind {
    Ollama,
    None,
}

impl ExtractorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::None => "none",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[arg(long, default_value = ".cache/gradescan")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(required = true)]
    pub pdfs: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = LayoutArg::Auto)]
    pub layout: LayoutArg,

    #[arg(long, value_enum, default_value_t = TranscriberKind::Tesseract)]
    pub transcriber: TranscriberKind,

    #[arg(long, value_enum, default_value_t = ExtractorKind::None)]
    pub extractor: ExtractorKind,

    /// Region-of-interest hints, e.g. `--region "page 2"`. Transcribed concurrently, at
    /// most four at a time.
    #[arg(long = "region")]
    pub regions: Vec<String>,

    /// Pre-transcribed text used by `--transcriber text-file`.
    #[arg(long)]
    pub transcript_path: Option<PathBuf>,

    #[arg(long, default_value = "jpn+eng")]
    pub ocr_lang: String,

    /// Page render resolution handed to pdftoppm before tesseract.
    #[arg(long, default_value_t = DEFAULT_RENDER_DPI)]
    pub ocr_dpi: u32,

    #[arg(long, env = "GRADESCAN_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
    pub ollama_url: String,

    #[arg(long, env = "GRADESCAN_OLLAMA_MODEL", default_value = "qwen2.5vl")]
    pub ollama_model: String,

    #[arg(long, default_value_t = 300)]
    pub ollama_timeout_secs: u64,

    #[arg(long)]
    pub json_out: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub markdown: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ParseArgs {
    pub transcript: PathBuf,

    #[arg(long, value_enum, default_value_t = LayoutArg::Auto)]
    pub layout: LayoutArg,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub markdown: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[arg(long, default_value = ".cache/gradescan")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Document handle (sha256) as printed by `extract`.
    pub document: String,

    #[arg(long)]
    pub output: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/gradescan")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}
