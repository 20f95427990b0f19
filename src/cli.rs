use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mockview")]
#[command(author, version, about = "Compose and publish interview practice recordings")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record the camera (or the screen) with microphone audio
    Record {
        /// Output file; the extension picks the container
        #[arg(short, long, default_value = "take.webm")]
        output: PathBuf,

        /// Record the screen instead of the camera, with system audio mixed in
        #[arg(long)]
        screen: bool,

        /// Stop after this many seconds; Ctrl-C stops otherwise
        #[arg(short, long)]
        duration: Option<f64>,
    },

    /// Stitch recordings end to end into one recording
    Combine {
        /// Recordings in playback order
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<PathBuf>,

        /// Output file; the extension picks the container
        #[arg(short, long, default_value = "combined.webm")]
        output: PathBuf,
    },

    /// Composite a recording onto a styled background
    Compose {
        /// Recording to compose
        #[arg(required = true)]
        input: PathBuf,

        /// Background image
        #[arg(short, long)]
        background: PathBuf,

        /// Output file (defaults to <input>.composed.mp4)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Target aspect ratio: 16:9, 9:16, 1:1, 4:3 or 4:5
        #[arg(long, default_value = "16:9")]
        aspect: String,

        /// Draw a border around the recording
        #[arg(long)]
        border: bool,

        /// Draw a drop shadow behind the recording
        #[arg(long)]
        shadow: bool,

        /// Background blur (0-20)
        #[arg(long, default_value = "0")]
        blur: u8,

        /// Interior scale (0.5-1.0); config default when unset
        #[arg(long)]
        scale: Option<f64>,

        /// Recording length in seconds, for progress reporting
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Upload a recording to the video host
    Upload {
        /// File to upload
        #[arg(required = true)]
        file: PathBuf,

        /// Video title
        #[arg(short, long)]
        title: String,

        #[arg(short, long, default_value = "")]
        description: String,

        /// Extra tags, added to the configured defaults
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// OAuth access token with the upload scope
        #[arg(long, env = "MOCKVIEW_UPLOAD_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Check that the encoding engine is available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },
}
