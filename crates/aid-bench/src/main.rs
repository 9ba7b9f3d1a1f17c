use std::path::PathBuf;
use std::sync::Arc;

use aid_bench::action::Action;
use aid_bench::api::OptionsClient;
use aid_bench::core::{BenchCore, CoreHandle, Notice};
use aid_bench::options::OptionsCache;
use aid_bench::upload::UploadFile;
use aid_proto::protocol::OptionKind;
use aid_proto::store::{ImageId, Store};
use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

const HELP: &str = "\
commands:
  endpoint <name|url>     select the API endpoint (stg, prod or a URL)
  key <text>              set the API key field
  type <text>             type the API key one character at a time
  load                    load options with the current key
  upload [path...]        pick image files (no paths clears the picker)
  style <value>           toggle a style option
  room <image-id> <type>  set an image's room type
  rm <image-id>           delete one image
  rm-all                  delete every stored image
  reset                   delete the whole local database
  submit                  validate and print the form
  show                    print the current form state
  quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = aid_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("aid-bench.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // Allow RUST_LOG override; default to debug for app code but suppress noisy
    // connection-level DEBUG from HTTP client internals (hyper_util, reqwest).
    let log_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "debug,hyper_util=warn,reqwest=warn,hyper=warn".to_string());
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_env_filter(log_filter.as_str())
        .with_ansi(false)
        .init();

    eprintln!("aid-bench log: {}", log_path.display());
    tracing::info!("aid-bench starting…");

    // ── Load config ──────────────────────────────────────────────────────────
    let config = aid_proto::config::Config::load().unwrap_or_else(|e| {
        tracing::warn!("config: {}; using defaults", e);
        Default::default()
    });

    // ── Shared services ──────────────────────────────────────────────────────
    let store = Arc::new(Store::new(config.store.db_path.clone()));
    let client = OptionsClient::new(&config.api)?;
    let room_options = Arc::new(OptionsCache::new(OptionKind::Room, client.clone()));

    // ── Notice channel (BenchCore → terminal) ────────────────────────────────
    let (notice_tx, notice_rx) = broadcast::channel::<Notice>(256);
    tokio::spawn(print_notices(notice_rx));

    let (core, handle) = BenchCore::new(config, store, client, room_options, notice_tx);
    let core_task = tokio::spawn(core.run());

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !dispatch(&handle, line.trim()).await {
            break;
        }
    }

    handle.send(Action::Quit);
    if let Err(e) = core_task.await {
        tracing::error!("BenchCore task failed: {}", e);
    }
    tracing::info!("aid-bench exiting");
    Ok(())
}

/// Turn one input line into actions.  Returns `false` to quit.
async fn dispatch(handle: &CoreHandle, line: &str) -> bool {
    let (cmd, rest) = line
        .split_once(char::is_whitespace)
        .map(|(c, r)| (c, r.trim()))
        .unwrap_or((line, ""));

    let action = match cmd {
        "" => return true,
        "quit" | "exit" | "q" => return false,
        "help" | "?" => {
            println!("{}", HELP);
            return true;
        }
        "endpoint" => Action::SelectEndpoint(rest.to_string()),
        "key" => Action::EditKey(rest.to_string()),
        "type" => {
            let mut typed = String::new();
            for c in rest.chars() {
                typed.push(c);
                handle.send(Action::EditKey(typed.clone()));
            }
            return true;
        }
        "load" => Action::LoadKey,
        "upload" => Action::SelectFiles(read_files(rest).await),
        "style" => Action::ToggleStyle(rest.to_string()),
        "room" => match rest.split_once(char::is_whitespace) {
            Some((id, room_type)) => Action::SetRoomType {
                id: ImageId::new(id),
                room_type: room_type.trim().to_string(),
            },
            None => {
                println!("usage: room <image-id> <type>");
                return true;
            }
        },
        "rm" if !rest.is_empty() => Action::DeleteImage(ImageId::new(rest)),
        "rm-all" => Action::DeleteAllImages,
        "reset" => Action::ResetStore,
        "submit" => Action::Submit,
        "show" => Action::Show,
        other => {
            println!("unknown command: {} (try `help`)", other);
            return true;
        }
    };
    handle.send(action)
}

async fn read_files(args: &str) -> Option<Vec<UploadFile>> {
    let paths: Vec<PathBuf> = args.split_whitespace().map(PathBuf::from).collect();
    if paths.is_empty() {
        return None;
    }
    let reads = join_all(paths.iter().map(|p| UploadFile::from_path(p))).await;
    let mut files = Vec::with_capacity(reads.len());
    for (path, read) in paths.iter().zip(reads) {
        match read {
            Ok(file) => files.push(file),
            Err(e) => println!("! cannot read {}: {}", path.display(), e),
        }
    }
    Some(files)
}

async fn print_notices(mut rx: broadcast::Receiver<Notice>) {
    loop {
        let notice = match rx.recv().await {
            Ok(notice) => notice,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                println!("! {} message(s) dropped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match notice {
            Notice::Info(msg) => println!("  {}", msg),
            Notice::Error(msg) => println!("! {}", msg),
            Notice::Rejected(msg) => println!("! rejected {}", msg),
            Notice::KeyChanged { value, state } => println!("  key: {:?} ({:?})", value, state),
            Notice::StyleOptions(items) => {
                let values: Vec<_> = items.iter().map(|i| i.value.as_str()).collect();
                println!("  styles: [{}]", values.join(", "));
            }
            Notice::RoomOptions(items) => {
                let values: Vec<_> = items.iter().map(|i| i.value.as_str()).collect();
                println!("  room types: [{}]", values.join(", "));
            }
            Notice::ImagesChanged(ids) => println!("  images: {}", ids.len()),
            Notice::Previews(items) => {
                for item in items {
                    let room = if item.room_type.is_empty() {
                        "-"
                    } else {
                        item.room_type.as_str()
                    };
                    println!("  [{}] {} room={} {}", item.id, item.title, room, item.url);
                }
            }
            Notice::Submitted(values) => match serde_json::to_string_pretty(&values) {
                Ok(json) => println!("{}", json),
                Err(e) => println!("! {}", e),
            },
            Notice::Snapshot(snapshot) => println!("{:#?}", snapshot),
        }
    }
}
