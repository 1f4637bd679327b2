// UI layer: one handler per subcommand. Handlers load the credentials,
// call the API client and render the result as a table or JSON. Prompts
// use `dialoguer`, long running work shows an `indicatif` bar.

use anyhow::{anyhow, bail, Context, Result};
use crossterm::style::Stylize;
use dialoguer::{Confirm, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::api::{ApiClient, ImageSetUpdate};
use crate::cli::{
    AnnotationCommand, AnnotationFormat, Cli, Command, ConfigCommand, FolderCommand,
    GroupCommand, ImageCommand, ImagesetCommand,
};
use crate::config::{self, Credentials, PartialCredentials, SaveOutcome};
use crate::error::Error;
use crate::models::{AnnotationFilters, FolderFilters, ImageFilters, Pagination};
use crate::table::Table;
use crate::upload::UploadObserver;

const GROUP_COLUMNS: &[(&str, &str)] = &[
    ("id", "ID"),
    ("name", "Name"),
    ("imageSetCount", "#ImageSets"),
    ("ownerName", "Owner"),
];

const IMAGESET_COLUMNS: &[(&str, &str)] = &[
    ("id", "ID"),
    ("name", "Name"),
    ("imageCount", "#Images"),
    ("ownerName", "Owner"),
    ("groupName", "Group"),
];

const IMAGE_COLUMNS: &[(&str, &str)] = &[
    ("id", "ID"),
    ("name", "Name"),
    ("imageSetName", "ImageSet"),
    ("imgWidth", "Width"),
    ("imgHeight", "Height"),
    ("mppx", "MPP_x"),
    ("mppy", "MPP_y"),
    ("filesize", "Filesize"),
    ("hasAnnotations", "Has Annotations"),
    ("status", "Status"),
];

const FOLDER_COLUMNS: &[(&str, &str)] = &[
    ("id", "ID"),
    ("label", "Label"),
    ("imageSetName", "ImageSet"),
    ("folderParentId", "Parent"),
    ("hasMetadata", "Has Metadata"),
    ("rank", "Rank"),
];

const ANNOTATION_COLUMNS: &[(&str, &str)] = &[
    ("id", "ID"),
    ("text", "Text"),
    ("imageId", "ImageId"),
    ("color", "Color"),
    ("creatorName", "Creator"),
    ("shape", "Shape"),
    ("size", "Size"),
];

const DEBUG_DIRECTIVE: &str = "warn,concentriq_cli=debug,concentriq=debug";

/// Whether a `CONCENTRIQ_DEBUG` value asks for debug logs (`1` or `true`).
pub fn debug_requested(value: Option<&str>) -> bool {
    value.is_some_and(|v| matches!(v.to_lowercase().as_str(), "1" | "true"))
}

/// Log filter directive: crate debug logs when asked for, otherwise
/// `RUST_LOG` or warnings only.
pub fn log_directive(debug: bool, rust_log: Option<&str>) -> String {
    match rust_log {
        _ if debug => DEBUG_DIRECTIVE.to_string(),
        Some(directive) if !directive.trim().is_empty() => directive.to_string(),
        _ => "warn".to_string(),
    }
}

/// Dispatch a parsed command line.
pub fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_path);
    match cli.command {
        Command::Group(cmd) => handle_group(cmd, &config_path),
        Command::Imageset(cmd) => handle_imageset(cmd, &config_path),
        Command::Image(cmd) => handle_image(cmd, &config_path),
        Command::Folder(cmd) => handle_folder(cmd, &config_path),
        Command::Annotation(cmd) => handle_annotation(cmd, &config_path),
        Command::Config(cmd) => handle_config(cmd, &config_path),
    }
}

/// Build the API client, pointing at `config setup` when nothing is configured.
fn load_api(config_path: &Path) -> Result<ApiClient> {
    match ApiClient::from_config_file(config_path) {
        Ok(api) => Ok(api),
        Err(err @ Error::MissingConfig { .. }) => Err(anyhow!(err)
            .context("please run `concentriq config setup` to add api_url to your config")),
        Err(err) => Err(err.into()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a list as JSON or as a table.
fn show_list<T: Serialize>(
    json: bool,
    title: &str,
    columns: &[(&str, &str)],
    records: &[T],
) -> Result<()> {
    if json {
        print_json(records)
    } else {
        Table::from_records(title, columns, records)?.print();
        Ok(())
    }
}

/// Print a single record as JSON or as a key/value table.
fn show_record<T: Serialize>(json: bool, title: &str, record: &T) -> Result<()> {
    if json {
        print_json(record)
    } else {
        Table::key_value(title, record)?.print();
        Ok(())
    }
}

/// Write to `output` or stdout.
fn write_output(output: Option<&Path>, data: &str) -> Result<()> {
    match output {
        Some(path) => fs::write(path, data)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data.as_bytes())?;
            if !data.ends_with('\n') {
                stdout.write_all(b"\n")?;
            }
            Ok(())
        }
    }
}

/// Ask before destructive actions unless `force` is set.
fn confirm_or_abort(force: bool) -> Result<()> {
    if force {
        return Ok(());
    }
    let proceed = Confirm::new()
        .with_prompt("Are you sure?")
        .default(false)
        .interact()?;
    if !proceed {
        println!("not deleting.");
        bail!("Aborted!");
    }
    Ok(())
}

fn report_deleted(kind: &str, id: i64, ok: bool) {
    if ok {
        println!("{}", format!("deleted {kind} #{id}").green());
    } else {
        eprintln!("{}", format!("server did not confirm deleting {kind} #{id}").yellow());
    }
}

fn handle_group(cmd: GroupCommand, config_path: &Path) -> Result<()> {
    let api = load_api(config_path)?;
    match cmd {
        GroupCommand::List { output } => {
            let groups = api.group_list()?;
            show_list(output.json, "Groups", GROUP_COLUMNS, &groups)
        }
        GroupCommand::Info { id, output } => {
            let group = api.group_get(id)?;
            show_record(output.json, &format!("Group #{id}"), &group)
        }
    }
}

fn handle_imageset(cmd: ImagesetCommand, config_path: &Path) -> Result<()> {
    let api = load_api(config_path)?;
    match cmd {
        ImagesetCommand::List {
            output,
            filter_group,
            filter_owner,
        } => {
            let contains = |haystack: Option<&str>, needle: &Option<String>| match needle {
                None => true,
                Some(n) => haystack
                    .unwrap_or_default()
                    .to_lowercase()
                    .contains(&n.to_lowercase()),
            };
            let sets: Vec<_> = api
                .imageset_list()?
                .into_iter()
                .filter(|s| {
                    contains(s.group_name.as_deref(), &filter_group)
                        && contains(Some(s.owner_name.as_str()), &filter_owner)
                })
                .collect();
            show_list(output.json, "ImageSets", IMAGESET_COLUMNS, &sets)
        }
        ImagesetCommand::Info { id, output } => {
            let set = api.imageset_get(id)?;
            show_record(output.json, &format!("Imageset #{id}"), &set)
        }
        ImagesetCommand::Create {
            name,
            group_id,
            output,
        } => {
            let set = api.imageset_create(&name, group_id)?;
            show_record(output.json, &format!("Imageset #{}", set.id), &set)
        }
        ImagesetCommand::Update {
            id,
            name,
            description,
            output,
        } => {
            let update = ImageSetUpdate { name, description };
            if update.is_empty() {
                bail!("nothing to update, pass --name and/or --description");
            }
            let set = api.imageset_update(id, &update)?;
            show_record(output.json, &format!("Imageset #{id}"), &set)
        }
        ImagesetCommand::Delete { id, force } => {
            eprintln!("{}", format!("Deleting imageset #{id}").red());
            confirm_or_abort(force.force)?;
            report_deleted("imageset", id, api.imageset_delete(id)?);
            Ok(())
        }
        ImagesetCommand::ExportMetadataCsv { id, output } => {
            let csv = api.imageset_export_metadata_csv(id)?;
            write_output(output.as_deref(), &csv)
        }
    }
}

/// Upload progress as a byte based bar.
struct UploadProgress {
    bar: ProgressBar,
}

impl UploadProgress {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{bar:40}] {bytes}/{total_bytes} ({eta}) {msg}",
            )?
            .progress_chars("=> "),
        );
        bar.set_message("requesting upload id...");
        Ok(UploadProgress { bar })
    }
}

impl UploadObserver for UploadProgress {
    fn initiated(&self, upload_id: &str, total_parts: u32, total_bytes: u64) {
        tracing::info!(upload_id, total_parts, "multipart upload started");
        self.bar.set_length(total_bytes);
        self.bar.set_message(format!("0/{total_parts} parts"));
    }

    fn part_uploaded(&self, part_number: u32, bytes: u64, etag: &str) {
        tracing::debug!(part_number, etag, "part uploaded");
        self.bar.inc(bytes);
        self.bar.set_message(format!("part {part_number} done"));
    }

    fn completed(&self, etag: &str) {
        tracing::debug!(etag, "upload finalized");
        self.bar.finish_with_message("uploaded");
    }
}

/// File name of a signed url, decoded like a form value.
fn download_file_name(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split('?').next().unwrap_or_default().to_string());
    let base = path.rsplit('/').next().unwrap_or_default().replace('+', " ");
    urlencoding::decode(&base)
        .map(|s| s.into_owned())
        .unwrap_or(base)
}

fn handle_image(cmd: ImageCommand, config_path: &Path) -> Result<()> {
    let api = load_api(config_path)?;
    match cmd {
        ImageCommand::List {
            output,
            no_pagination,
            all,
            page_size,
            page,
            sort_by,
            descending,
            filter_has_annotations,
            filter_imageset_id,
            filter_name,
        } => {
            let filters = ImageFilters {
                has_annotations: filter_has_annotations,
                image_set_id: (!filter_imageset_id.is_empty()).then_some(filter_imageset_id),
                name: (!filter_name.is_empty()).then_some(filter_name),
                ..Default::default()
            };
            let filters = (filters != ImageFilters::default()).then_some(filters);
            let page_size = page_size.max(10);

            if all {
                let mut images = Vec::new();
                for batch in api.image_pages(filters.as_ref(), page_size, sort_by.into(), descending)? {
                    images.extend(batch?);
                }
                return show_list(output.json, "Images", IMAGE_COLUMNS, &images);
            }

            let pagination = (!no_pagination)
                .then(|| Pagination::new(page_size, page, sort_by.into(), descending));
            let (images, info) = api.image_list(pagination.as_ref(), filters.as_ref())?;
            show_list(output.json, "Images", IMAGE_COLUMNS, &images)?;
            if let Some(info) = info {
                eprintln!("{}", format!("# {info}").cyan());
            }
            Ok(())
        }
        ImageCommand::Info { id, output } => {
            let image = api.image_get(id)?;
            show_record(output.json, &format!("Image #{id}"), &image)
        }
        ImageCommand::Download { id, json, curl } => {
            let url = api.image_download(id)?;
            if curl {
                println!("url = \"{url}\"\noutput = \"{}\"\n", download_file_name(&url));
            } else if json {
                print_json(&serde_json::json!({ "id": id, "url": url }))?;
            } else {
                println!("{url}");
            }
            Ok(())
        }
        ImageCommand::Upload {
            path,
            imageset_id,
            folder_id,
            output,
        } => {
            if !path.is_file() {
                bail!("{} is not a readable file", path.display());
            }
            let progress = UploadProgress::new()?;
            let result = api.image_upload(&path, imageset_id, folder_id, &progress);
            if result.is_err() {
                progress.bar.abandon_with_message("failed");
            }
            let image = result?;
            show_record(output.json, &format!("Image #{}", image.id), &image)
        }
        ImageCommand::Delete { id, force } => {
            eprintln!("{}", format!("Deleting image #{id}").red());
            confirm_or_abort(force.force)?;
            report_deleted("image", id, api.image_delete(id)?);
            Ok(())
        }
    }
}

fn handle_folder(cmd: FolderCommand, config_path: &Path) -> Result<()> {
    let api = load_api(config_path)?;
    match cmd {
        FolderCommand::List {
            output,
            imageset_id,
            include_metadata,
        } => {
            let filters = (!imageset_id.is_empty()).then(|| FolderFilters {
                image_set_id: Some(imageset_id),
                ..Default::default()
            });
            let folders = api.folder_list(include_metadata, None, filters.as_ref())?;
            show_list(output.json, "Folders", FOLDER_COLUMNS, &folders)
        }
    }
}

fn handle_annotation(cmd: AnnotationCommand, config_path: &Path) -> Result<()> {
    let api = load_api(config_path)?;
    match cmd {
        AnnotationCommand::List {
            output,
            filter_image_id,
            filter_name,
        } => {
            let filters = AnnotationFilters {
                image_id: (!filter_image_id.is_empty()).then_some(filter_image_id),
                text: (!filter_name.is_empty()).then_some(filter_name),
                ..Default::default()
            };
            let filters = (filters != AnnotationFilters::default()).then_some(filters);
            let annotations = api.annotation_list(filters.as_ref())?;
            show_list(output.json, "Annotations", ANNOTATION_COLUMNS, &annotations)
        }
        AnnotationCommand::Export {
            id,
            format,
            output,
            ignore_unsupported,
        } => {
            let data = match format {
                AnnotationFormat::Geojson => {
                    let features = api.annotation_export_geojson(id, ignore_unsupported)?;
                    serde_json::to_string_pretty(&features)?
                }
                AnnotationFormat::Proscia => api.annotation_export_xml(id)?,
            };
            write_output(output.as_deref(), &data)
        }
        AnnotationCommand::Import {
            path,
            image_id,
            skip_errors,
        } => {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            match ext.as_deref() {
                Some("json") | Some("geojson") => {
                    let created = api.annotation_import_geojson(&path, image_id, skip_errors)?;
                    println!("{}", format!("imported {} annotations", created.len()).green());
                }
                Some("xml") => {
                    api.annotation_import_xml(&path, image_id)?;
                    println!("{}", format!("imported annotations from {}", path.display()).green());
                }
                _ => bail!("must provide json or xml file"),
            }
            Ok(())
        }
        AnnotationCommand::Delete {
            annotation_id,
            image_id,
            force,
        } => {
            let ids: Vec<i64> = match (annotation_id, image_id.is_empty()) {
                (Some(_), false) => bail!("can't provide annotation_id when using --image-id"),
                (Some(id), true) => vec![id],
                (None, false) => {
                    let filters = AnnotationFilters {
                        image_id: Some(image_id),
                        ..Default::default()
                    };
                    api.annotation_list(Some(&filters))?
                        .into_iter()
                        .filter_map(|a| a.id)
                        .collect()
                }
                (None, true) => bail!("provide an annotation id or --image-id"),
            };

            eprintln!("{}", format!("Deleting {} annotations", ids.len()).red());
            confirm_or_abort(force.force)?;

            let bar = ProgressBar::new(ids.len() as u64);
            bar.set_style(ProgressStyle::with_template("[{bar:40}] {pos}/{len}")?.progress_chars("=> "));
            for id in ids {
                api.annotation_delete(id)
                    .with_context(|| format!("Failed to delete annotation {id}"))?;
                bar.inc(1);
            }
            bar.finish();
            Ok(())
        }
    }
}

fn handle_config(cmd: ConfigCommand, config_path: &Path) -> Result<()> {
    match cmd {
        ConfigCommand::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        ConfigCommand::Ping => {
            let api = load_api(config_path)?;
            match api.group_list() {
                Ok(_) => {
                    println!("{}", format!("{} -> pong", api.api_url()).green());
                    Ok(())
                }
                Err(err) => {
                    let msg = format!("can't reach concentriq instance: {err}");
                    eprintln!("{}", msg.as_str().red().bold());
                    Err(err.into())
                }
            }
        }
        ConfigCommand::Setup {
            path,
            api_url,
            user,
            password,
            ssl_certificate,
            no_backup,
        } => {
            let path = path.unwrap_or_else(|| config_path.to_path_buf());
            setup(&path, api_url, user, password, ssl_certificate, !no_backup)
        }
        ConfigCommand::Show => {
            let mut partial = PartialCredentials::load(config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            partial.apply_env();
            let mut table = Table::new(format!("{}", config_path.display()), &["Key", "Value"]);
            let unset = || "<unset>".to_string();
            table.add_row(vec!["api_url".into(), partial.api_url.unwrap_or_else(unset)]);
            table.add_row(vec!["user".into(), partial.user.unwrap_or_else(unset)]);
            table.add_row(vec![
                "password".into(),
                partial.password.map(|_| "********".to_string()).unwrap_or_else(unset),
            ]);
            table.add_row(vec![
                "ssl_certificate".into(),
                partial
                    .ssl_certificate
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(unset),
            ]);
            table.print();
            Ok(())
        }
    }
}

/// Collect credentials (flags first, then prompts) and write them to `path`.
fn setup(
    path: &Path,
    api_url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    ssl_certificate: Option<PathBuf>,
    backup: bool,
) -> Result<()> {
    // previous values become prompt defaults
    let existing = PartialCredentials::load(path).unwrap_or_default();

    let api_url = match api_url {
        Some(v) => v,
        None => {
            let mut input = Input::<String>::new();
            input.with_prompt("Api url");
            if let Some(v) = existing.api_url.clone() {
                input.default(v);
            }
            input.interact_text()?
        }
    };
    let user = match user {
        Some(v) => v,
        None => {
            let mut input = Input::<String>::new();
            input.with_prompt("User email");
            if let Some(v) = existing.user.clone() {
                input.default(v);
            }
            input.interact_text()?
        }
    };
    let password = SecretString::from(match password {
        Some(v) => v,
        None => Password::new()
            .with_prompt("Password")
            .with_confirmation("Repeat password", "Error: the passwords don't match.")
            .interact()?,
    });
    let ssl_certificate = match ssl_certificate {
        Some(p) => {
            if !p.is_file() {
                bail!("ssl certificate {} is not a readable file", p.display());
            }
            Some(
                p.canonicalize()
                    .with_context(|| format!("Failed to resolve {}", p.display()))?,
            )
        }
        None => None,
    };

    let creds = Credentials {
        api_url,
        user,
        password,
        ssl_certificate,
    };
    match config::save(path, &creds, backup)? {
        SaveOutcome::Unchanged => println!("{}", "no changes".green()),
        SaveOutcome::Written { backup } => {
            if let Some(b) = backup {
                println!("{}", format!("created backup {}", b.display()).yellow());
            }
            println!("wrote credentials to {}", path.display());
        }
    }
    Ok(())
}
