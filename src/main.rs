use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use tagweave::{
    logging, Config, DirectoryMediaSource, FilterState, MediaSource, TagGraphService, TagId,
    UNTAGGED,
};

enum Command {
    Tree,
    Create { name: String, parent: Option<String> },
    Rename { tag: String, name: String },
    Delete { tag: String },
    Reparent { tag: String, parent: Option<String> },
    RefAdd { parent: String, child: String },
    RefRemove { parent: String, child: String },
    Tag { tag: String, paths: Vec<String> },
    Untag { tag: String, paths: Vec<String> },
    Stats { tag: Option<String> },
    Filter { active: Vec<String>, excluded: Vec<String> },
    Prune,
}

struct Cli {
    config_path: Option<PathBuf>,
    json: bool,
    command: Command,
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut json = false;
    let mut rest = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("tagweave {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    usage_error("--config requires a path argument");
                }
            }
            "--json" => json = true,
            _ => rest.push(args[i].clone()),
        }
        i += 1;
    }

    Cli {
        config_path,
        json,
        command: parse_command(&rest),
    }
}

fn parse_command(args: &[String]) -> Command {
    let arg = |n: usize, what: &str| -> String {
        match args.get(n) {
            Some(value) => value.clone(),
            None => usage_error(&format!("missing {}", what)),
        }
    };

    match args.first().map(String::as_str) {
        None | Some("tree") => Command::Tree,
        Some("create") => {
            let name = arg(1, "tag name");
            let parent = match args.get(2).map(String::as_str) {
                Some("--parent") => Some(arg(3, "parent tag")),
                Some(other) => usage_error(&format!("unexpected argument {}", other)),
                None => None,
            };
            Command::Create { name, parent }
        }
        Some("rename") => Command::Rename {
            tag: arg(1, "tag"),
            name: arg(2, "new name"),
        },
        Some("delete") => Command::Delete { tag: arg(1, "tag") },
        Some("reparent") => Command::Reparent {
            tag: arg(1, "tag"),
            parent: match args.get(2).map(String::as_str) {
                None | Some("--root") => None,
                Some(parent) => Some(parent.to_string()),
            },
        },
        Some("ref") => {
            let parent = arg(2, "parent tag");
            let child = arg(3, "child tag");
            match args.get(1).map(String::as_str) {
                Some("add") => Command::RefAdd { parent, child },
                Some("rm") => Command::RefRemove { parent, child },
                _ => usage_error("ref expects add or rm"),
            }
        }
        Some("tag") | Some("untag") => {
            let tag = arg(1, "tag");
            let paths: Vec<String> = args.iter().skip(2).cloned().collect();
            if paths.is_empty() {
                usage_error("missing media paths");
            }
            if args[0] == "tag" {
                Command::Tag { tag, paths }
            } else {
                Command::Untag { tag, paths }
            }
        }
        Some("stats") => Command::Stats {
            tag: args.get(1).cloned(),
        },
        Some("filter") => {
            let mut active = Vec::new();
            let mut excluded = Vec::new();
            let mut i = 1;
            while i < args.len() {
                if args[i] == "--not" {
                    excluded.push(arg(i + 1, "excluded tag"));
                    i += 1;
                } else {
                    active.push(args[i].clone());
                }
                i += 1;
            }
            Command::Filter { active, excluded }
        }
        Some("prune") => Command::Prune,
        Some(other) => usage_error(&format!("unknown command {}", other)),
    }
}

fn usage_error(message: &str) -> ! {
    eprintln!("Error: {}", message);
    print_help();
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"tagweave - hierarchical tags for media collections

USAGE:
    tagweave [OPTIONS] [COMMAND]

COMMANDS:
    tree                            Show the tag tree (default)
    create NAME [--parent TAG]      Create a tag
    rename TAG NAME                 Rename a tag
    delete TAG                      Delete a tag
    reparent TAG [PARENT|--root]    Move a tag in the hierarchy
    ref add|rm PARENT CHILD         Add or remove a reference
    tag TAG PATH...                 Apply a tag to media
    untag TAG PATH...               Remove a tag from media
    stats [TAG]                     Show image counts
    filter [TAG...] [--not TAG]...  List media matching every TAG and no --not TAG
    prune                           Drop tags on media that no longer exists

TAG is a numeric id, a tag name, or "untagged".

OPTIONS:
    --config, -c PATH   Path to config file
    --json              Print machine-readable output
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    TAGWEAVE_LOG        Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/tagweave/config.toml"#
    );
}

async fn resolve(service: &TagGraphService, tag: &str) -> Result<TagId> {
    if tag.eq_ignore_ascii_case("untagged") {
        return Ok(UNTAGGED);
    }
    if let Ok(id) = tag.parse::<TagId>() {
        return Ok(id);
    }
    match service.find_tag(tag).await? {
        Some(found) => Ok(found.id),
        None => bail!("No tag named {:?}", tag),
    }
}

async fn resolve_all(service: &TagGraphService, tags: &[String]) -> Result<Vec<TagId>> {
    let mut ids = Vec::with_capacity(tags.len());
    for tag in tags {
        ids.push(resolve(service, tag).await?);
    }
    Ok(ids)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(service: &TagGraphService, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Tree => {
            let tree = service.tree().await?;
            if json {
                print_json(&tree)?;
            } else {
                print!("{}", tree.render());
            }
        }
        Command::Create { name, parent } => {
            let parent = match parent {
                Some(parent) => Some(resolve(service, &parent).await?),
                None => None,
            };
            let id = service.create_tag(&name, parent).await?;
            println!("Created tag {} [{}]", name.trim(), id);
        }
        Command::Rename { tag, name } => {
            let id = resolve(service, &tag).await?;
            service.rename_tag(id, &name).await?;
        }
        Command::Delete { tag } => {
            let id = resolve(service, &tag).await?;
            service.delete_tag(id).await?;
            println!("Deleted tag {}", id);
        }
        Command::Reparent { tag, parent } => {
            let id = resolve(service, &tag).await?;
            let parent = match parent {
                Some(parent) => Some(resolve(service, &parent).await?),
                None => None,
            };
            if !service.set_hierarchy_parent(id, parent).await? {
                bail!("Cannot move tag {}: it would contain itself", id);
            }
        }
        Command::RefAdd { parent, child } => {
            let parent = resolve(service, &parent).await?;
            let child = resolve(service, &child).await?;
            if !service.add_reference(parent, child).await? {
                bail!("Cannot reference {} from {}: it would create a cycle or already exists", child, parent);
            }
        }
        Command::RefRemove { parent, child } => {
            let parent = resolve(service, &parent).await?;
            let child = resolve(service, &child).await?;
            if !service.remove_reference(parent, child).await? {
                println!("No reference from {} to {}", parent, child);
            }
        }
        Command::Tag { tag, paths } => {
            let id = resolve(service, &tag).await?;
            let outcome = service.apply_tags(&[id], &paths).await?;
            println!("{}", outcome.summary("Tagged"));
        }
        Command::Untag { tag, paths } => {
            let id = resolve(service, &tag).await?;
            let outcome = service.remove_tags(&[id], &paths).await?;
            println!("{}", outcome.summary("Untagged"));
        }
        Command::Stats { tag } => {
            let ids = match tag {
                Some(tag) => vec![resolve(service, &tag).await?],
                None => {
                    let mut ids: Vec<TagId> =
                        service.all_tags().await?.iter().map(|t| t.id).collect();
                    ids.push(UNTAGGED);
                    ids
                }
            };
            let mut all = Vec::with_capacity(ids.len());
            for id in ids {
                all.push(service.statistics(id).await?);
            }
            if json {
                print_json(&all)?;
            } else {
                println!("{:>8} {:>8} {:>8} {:>10}", "tag", "direct", "total", "referenced");
                for s in all {
                    println!(
                        "{:>8} {:>8} {:>8} {:>10}",
                        s.tag_id, s.direct_image_count, s.total_image_count, s.referenced_count
                    );
                }
            }
        }
        Command::Filter { active, excluded } => {
            let active = resolve_all(service, &active).await?;
            let excluded = resolve_all(service, &excluded).await?;
            service.set_filter(FilterState::new(active, excluded));
            let items = service.filtered_media().await?;
            if json {
                print_json(&items)?;
            } else {
                for item in items {
                    println!("{}", item.path);
                }
            }
        }
        Command::Prune => {
            let removed = service.prune_missing_media().await?;
            println!("Removed {} associations", removed);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    // journald on Linux, file fallback otherwise
    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let media: Arc<dyn MediaSource> = Arc::new(DirectoryMediaSource::from_config(&config.media));
    let service = TagGraphService::open(&config, media)
        .await
        .with_context(|| format!("Failed to open tag store at {:?}", config.db_path))?;

    run(&service, cli.command, cli.json).await
}
