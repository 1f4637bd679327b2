//! Command line grammar.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::models::SortBy;

/// Interact with a Proscia Concentriq instance
#[derive(Parser, Debug)]
#[command(name = "concentriq")]
#[command(version, about = "Interact with a Proscia Concentriq instance", long_about = None)]
#[command(arg_required_else_help = true)]
#[command(after_help = "EXAMPLES:
    # Store api url and credentials
    concentriq config setup

    # Check that the instance is reachable
    concentriq config ping

    # List the images of imageset 12
    concentriq image list --filter-imageset-id 12

    # Upload a slide
    concentriq image upload --imageset-id 12 slide.svs

#### Proscia Concentriq from the command line ####")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Credentials file (default: platform config dir, or $CONCENTRIQ_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr (same as CONCENTRIQ_DEBUG=1)
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Images
    #[command(subcommand)]
    Image(ImageCommand),
    /// Imagesets (repositories)
    #[command(subcommand)]
    Imageset(ImagesetCommand),
    /// Groups
    #[command(subcommand)]
    Group(GroupCommand),
    /// Folders inside imagesets
    #[command(subcommand)]
    Folder(FolderCommand),
    /// Annotations on images
    #[command(subcommand)]
    Annotation(AnnotationCommand),
    /// Credentials and connectivity
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct JsonFlag {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct ForceFlag {
    /// Don't ask for confirmation
    #[arg(long)]
    pub force: bool,
}

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
    /// List available groups
    List {
        #[command(flatten)]
        output: JsonFlag,
    },
    /// Detailed info about a group
    Info {
        /// Group id
        #[arg(value_name = "ID")]
        id: i64,
        #[command(flatten)]
        output: JsonFlag,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImagesetCommand {
    /// List imagesets
    List {
        #[command(flatten)]
        output: JsonFlag,
        /// Only imagesets whose group name contains this text
        #[arg(long)]
        filter_group: Option<String>,
        /// Only imagesets whose owner name contains this text
        #[arg(long)]
        filter_owner: Option<String>,
    },
    /// Imageset info
    Info {
        #[arg(value_name = "ID")]
        id: i64,
        #[command(flatten)]
        output: JsonFlag,
    },
    /// Create an imageset in a group
    Create {
        /// Imageset name
        name: String,
        #[arg(long, value_name = "GROUP_ID")]
        group_id: i64,
        #[command(flatten)]
        output: JsonFlag,
    },
    /// Rename an imageset or change its description
    Update {
        #[arg(value_name = "ID")]
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[command(flatten)]
        output: JsonFlag,
    },
    /// Delete an imageset
    Delete {
        #[arg(value_name = "ID")]
        id: i64,
        #[command(flatten)]
        force: ForceFlag,
    },
    /// Export imageset metadata as csv
    ExportMetadataCsv {
        #[arg(value_name = "ID")]
        id: i64,
        /// Output file, default stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Name,
    Created,
    LastModified,
    Size,
}

impl From<SortKey> for SortBy {
    fn from(key: SortKey) -> Self {
        match key {
            SortKey::Name => SortBy::Name,
            SortKey::Created => SortBy::Created,
            SortKey::LastModified => SortBy::LastModified,
            SortKey::Size => SortBy::Size,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ImageCommand {
    /// List images
    List {
        #[command(flatten)]
        output: JsonFlag,
        /// Request everything in one call instead of a single page
        #[arg(long, conflicts_with = "all")]
        no_pagination: bool,
        /// Walk all pages
        #[arg(long)]
        all: bool,
        /// Page size (at least 10)
        #[arg(long, default_value_t = 50)]
        page_size: u32,
        /// Page index, starting at 1
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, value_enum, default_value_t = SortKey::Name)]
        sort_by: SortKey,
        #[arg(long)]
        descending: bool,
        /// Only images that have (true) or don't have (false) annotations
        #[arg(long, value_name = "BOOL")]
        filter_has_annotations: Option<bool>,
        /// Only images in this imageset (repeatable)
        #[arg(long, value_name = "ID")]
        filter_imageset_id: Vec<i64>,
        /// Only images with this name (repeatable)
        #[arg(long, value_name = "NAME")]
        filter_name: Vec<String>,
    },
    /// Image info
    Info {
        #[arg(value_name = "ID")]
        id: i64,
        #[command(flatten)]
        output: JsonFlag,
    },
    /// Print the signed download url of an image
    Download {
        #[arg(value_name = "ID")]
        id: i64,
        #[arg(long, conflicts_with = "curl")]
        json: bool,
        /// Print a curl config entry (url + output)
        #[arg(long)]
        curl: bool,
    },
    /// Upload an image file
    Upload {
        /// Path to the image
        path: PathBuf,
        #[arg(long, value_name = "IMAGESET_ID")]
        imageset_id: i64,
        /// Parent folder inside the imageset
        #[arg(long, value_name = "FOLDER_ID")]
        folder_id: Option<i64>,
        #[command(flatten)]
        output: JsonFlag,
    },
    /// Delete an image
    Delete {
        #[arg(value_name = "ID")]
        id: i64,
        #[command(flatten)]
        force: ForceFlag,
    },
}

#[derive(Subcommand, Debug)]
pub enum FolderCommand {
    /// List folders
    List {
        #[command(flatten)]
        output: JsonFlag,
        /// Only folders in this imageset (repeatable)
        #[arg(long, value_name = "ID")]
        imageset_id: Vec<i64>,
        /// Include folder metadata
        #[arg(long)]
        include_metadata: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationFormat {
    Geojson,
    /// Concentriq XML
    Proscia,
}

#[derive(Subcommand, Debug)]
pub enum AnnotationCommand {
    /// List annotations
    List {
        #[command(flatten)]
        output: JsonFlag,
        /// Only annotations on this image (repeatable)
        #[arg(long, value_name = "ID")]
        filter_image_id: Vec<i64>,
        /// Only annotations with this text (repeatable)
        #[arg(long, value_name = "TEXT")]
        filter_name: Vec<String>,
    },
    /// Export the annotations of an image
    Export {
        /// Image id
        #[arg(value_name = "ID")]
        id: i64,
        #[arg(long = "format", value_enum, default_value_t = AnnotationFormat::Geojson)]
        format: AnnotationFormat,
        /// Output file, default stdout
        #[arg(long)]
        output: Option<PathBuf>,
        /// Skip annotation shapes GeoJSON export doesn't handle yet
        #[arg(long)]
        ignore_unsupported: bool,
    },
    /// Import annotations from a .json (GeoJSON) or .xml (Concentriq) file
    Import {
        path: PathBuf,
        #[arg(long, value_name = "ID")]
        image_id: i64,
        /// Skip annotations that fail instead of aborting
        #[arg(long)]
        skip_errors: bool,
    },
    /// Delete one annotation, or all annotations of some images
    Delete {
        /// Annotation to delete
        #[arg(value_name = "ANNOTATION_ID", conflicts_with = "image_id")]
        annotation_id: Option<i64>,
        /// Delete every annotation on this image (repeatable)
        #[arg(long, value_name = "ID")]
        image_id: Vec<i64>,
        #[command(flatten)]
        force: ForceFlag,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the version
    Version,
    /// Check that the Concentriq instance answers
    Ping,
    /// Write credentials to disk, prompting for missing values
    Setup {
        /// Credentials file to write
        path: Option<PathBuf>,
        #[arg(long)]
        api_url: Option<String>,
        /// Concentriq user email
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// CA certificate (PEM) for instances with a private CA
        #[arg(long)]
        ssl_certificate: Option<PathBuf>,
        /// Don't keep a backup of the previous file
        #[arg(long)]
        no_backup: bool,
    },
    /// Show the active configuration (password hidden)
    Show,
}
