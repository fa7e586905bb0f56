mod cli;

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{BookmarkAction, CliArgs, Command, ContainerArgs, GroupAction, ObjectArgs};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use kubeplorer::config::EngineConfig;
use kubeplorer::engine::Engine;
use kubeplorer::k8s::KubeBackend;
use kubeplorer::registry::cluster_table;
use kubeplorer::model::{
    ChainEntry, ContainerTarget, InstanceDetails, KindGroups, ResourceInstance, TerminalSize,
};
use kubeplorer::session::UiEvent;
use kubeplorer::streaming::TerminalChannel;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    if let Err(error) = init_tracing(&args.log_filter) {
        eprintln!("{}", compact_error(&error));
    }

    if let Err(error) = run(args).await {
        eprintln!("error: {}", compact_error(&error));
        std::process::exit(1);
    }
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

fn engine_config(args: &CliArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::load(args.config.as_deref())?;
    config.apply_cli_overrides(args.poll_ms, args.probe_ms, args.state_dir.clone());
    if let Some(source) = &config.source {
        debug!("configuration loaded from {}", source.display());
    }
    Ok(config)
}

async fn run(args: CliArgs) -> Result<()> {
    let config = engine_config(&args)?;
    let backend = Arc::new(KubeBackend::new(
        args.kubeconfig.clone(),
        config.request_timeout,
    ));
    let engine = Engine::new(backend, config)?;

    let result = dispatch(&engine, args.command).await;
    engine.shutdown();
    result
}

async fn dispatch(engine: &Engine, command: Command) -> Result<()> {
    match command {
        Command::Clusters => list_clusters(engine).await,
        Command::Namespaces { cluster } => {
            for namespace in engine.namespaces().list_namespaces(&cluster).await? {
                println!("{namespace}");
            }
            Ok(())
        }
        Command::Kinds { cluster } => {
            let groups = engine.catalog().sync(&cluster).await?;
            print_groups(&groups);
            Ok(())
        }
        Command::Watch {
            cluster,
            namespace,
            kind,
            filter,
        } => watch(engine, &cluster, namespace.as_deref(), &kind, filter.as_deref()).await,
        Command::Deps(object) => dependencies(engine, object).await,
        Command::Yaml(object) => {
            let namespace = namespace_for(engine, &object.cluster, object.namespace).await?;
            let yaml = engine
                .get_resource_yaml(&object.cluster, &object.kind, &namespace, &object.name)
                .await?;
            print!("{yaml}");
            Ok(())
        }
        Command::Apply { cluster, file } => {
            let yaml = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            engine.apply_resource(&cluster, &yaml).await?;
            println!("applied {}", file.display());
            Ok(())
        }
        Command::Delete(object) => {
            let namespace = namespace_for(engine, &object.cluster, object.namespace).await?;
            engine
                .delete_resource(&object.cluster, &namespace, &object.kind, &object.name)
                .await?;
            println!("deleted {} {namespace}/{}", object.kind, object.name);
            Ok(())
        }
        Command::Events { object, json } => events(engine, object, json).await,
        Command::Secret {
            cluster,
            name,
            namespace,
        } => {
            let namespace = namespace_for(engine, &cluster, namespace).await?;
            for (key, value) in engine.decode_secret(&cluster, &namespace, &name).await? {
                println!("{key}: {value}");
            }
            Ok(())
        }
        Command::Logs { container, follow } => logs(engine, container, follow).await,
        Command::Shell {
            container,
            command,
            frames,
        } => shell(engine, container, command, frames).await,
        Command::Exec { container, command } => {
            let target = container_target(engine, container).await?;
            print!("{}", engine.gateway().run_command(&target, &command).await?);
            Ok(())
        }
        Command::Bookmarks { action } => bookmarks(engine, action.unwrap_or(BookmarkAction::List)),
        Command::Groups { action } => groups(engine, action.unwrap_or(GroupAction::List)),
        Command::Ask { prompt } => {
            let body = read_prompt(&prompt).await?;
            println!("{}", engine.forward_to_ollama(&body).await?);
            Ok(())
        }
    }
}

async fn namespace_for(engine: &Engine, cluster: &str, namespace: Option<String>) -> Result<String> {
    match namespace {
        Some(namespace) => Ok(namespace),
        None => Ok(engine.namespaces().default_namespace(cluster, None).await?),
    }
}

async fn list_clusters(engine: &Engine) -> Result<()> {
    engine.start().await?;
    engine.probe().probe_all().await;

    println!("{}", cluster_table(&engine.registry().snapshot()));
    Ok(())
}

async fn watch(
    engine: &Engine,
    cluster: &str,
    namespace: Option<&str>,
    kind: &str,
    filter: Option<&str>,
) -> Result<()> {
    engine.start().await?;
    let sessions = engine.sessions().clone();
    let id = sessions.active_session();
    let mut events = sessions.subscribe_events();

    sessions.select_cluster(id, cluster).await?;
    if let Some(namespace) = namespace {
        sessions.select_namespace(id, namespace)?;
    }
    let selection = sessions.select_kind(id, kind)?;
    info!("watching {}", selection.key());

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(UiEvent::Resources {
                session,
                key,
                items,
                diff,
            }) if session == id => {
                let rows = items
                    .into_iter()
                    .filter(|item| filter.is_none_or(|query| item.matches_filter(query)))
                    .collect::<Vec<_>>();
                println!(
                    "--- {key}: {} item(s), +{} ~{} -{}",
                    rows.len(),
                    diff.added.len(),
                    diff.updated.len(),
                    diff.removed.len()
                );
                print_instances(&rows);
            }
            Ok(UiEvent::ResourcesFailed { session, key, error }) if session == id => {
                warn!("poll of {key} failed: {error}");
            }
            Ok(UiEvent::ReturnedToClusterSelection { session, cluster }) if session == id => {
                bail!("lost connection to {cluster}");
            }
            Ok(UiEvent::Reachability(transition)) => {
                debug!(
                    "{} is now {}",
                    transition.cluster,
                    transition.to.label()
                );
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!("skipped {skipped} engine events"),
            Err(RecvError::Closed) => break,
        }
    }
    Ok(())
}

async fn dependencies(engine: &Engine, object: ObjectArgs) -> Result<()> {
    engine.start().await?;
    let namespace = namespace_for(engine, &object.cluster, object.namespace).await?;
    let cancel = CancellationToken::new();
    let resolving = engine.resolve_dependencies(
        &object.cluster,
        &object.kind,
        &namespace,
        &object.name,
        &cancel,
    );
    let chain = tokio::select! {
        chain = resolving => chain?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            bail!("interrupted");
        }
    };

    for entry in chain.entries() {
        match entry {
            ChainEntry::Application(app) => {
                println!("application  {}/{} on {}", app.namespace, app.name, app.cluster)
            }
            ChainEntry::Ancestor(reference) => {
                println!("owner        {} {}", reference.kind, reference.name)
            }
            ChainEntry::Current(reference) => {
                println!("* current    {} {}", reference.kind, reference.name)
            }
            ChainEntry::Descendant(reference) => {
                println!("dependent    {} {}", reference.kind, reference.name)
            }
        }
    }
    Ok(())
}

async fn events(engine: &Engine, object: ObjectArgs, json: bool) -> Result<()> {
    let namespace = namespace_for(engine, &object.cluster, object.namespace).await?;
    if json {
        let body = engine
            .get_events_json(&object.cluster, &object.kind, &namespace, &object.name)
            .await?;
        println!("{body}");
        return Ok(());
    }

    let events = engine
        .get_events(&object.cluster, &object.kind, &namespace, &object.name)
        .await?;
    if events.is_empty() {
        println!("no events");
        return Ok(());
    }
    println!("{:<8} {:<24} {:<6} {:<24} MESSAGE", "TYPE", "REASON", "AGE", "FROM");
    for event in events {
        println!(
            "{:<8} {:<24} {:<6} {:<24} {}",
            event.event_type, event.reason, event.age, event.from, event.message
        );
    }
    Ok(())
}

async fn container_target(engine: &Engine, args: ContainerArgs) -> Result<ContainerTarget> {
    let namespace = namespace_for(engine, &args.cluster, args.namespace).await?;
    let container = match args.container {
        Some(container) => container,
        None => engine
            .gateway()
            .containers(&args.cluster, &namespace, &args.pod)
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("pod {namespace}/{} has no containers", args.pod))?,
    };

    Ok(ContainerTarget {
        cluster: args.cluster,
        namespace,
        pod: args.pod,
        container,
    })
}

async fn logs(engine: &Engine, args: ContainerArgs, follow: bool) -> Result<()> {
    let target = container_target(engine, args).await?;
    if !follow {
        print!("{}", engine.gateway().fetch_logs(&target).await?);
        return Ok(());
    }

    let mut tail = engine.gateway().tail_logs(&target).await?;
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = tail.next_line() => line,
        };
        match line {
            Some(Ok(line)) => println!("{line}"),
            Some(Err(error)) => {
                warn!("log stream for {target} failed: {error}");
                break;
            }
            None => break,
        }
    }
    tail.close();
    Ok(())
}

async fn shell(
    engine: &Engine,
    args: ContainerArgs,
    command: Option<String>,
    frames: bool,
) -> Result<()> {
    let target = container_target(engine, args).await?;
    let channel = engine
        .gateway()
        .open_terminal(&target, command.as_deref())
        .await?;
    if frames {
        return pump_frames(channel).await;
    }

    enable_raw_mode().context("failed to enable raw mode")?;
    let run_result = pump_terminal(channel).await;
    let restore_result = disable_raw_mode().context("failed to disable raw mode");

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Copies local stdin to the container and its output back until either side ends.
async fn pump_terminal(mut channel: TerminalChannel) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buffer = vec![0_u8; 4096];
    let mut last_size = None;
    let mut resize_check = interval(Duration::from_millis(500));
    resize_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            read = stdin.read(&mut buffer) => {
                let read = read.context("failed to read stdin")?;
                if read == 0 {
                    break;
                }
                channel.send(&buffer[..read]).await?;
            }
            output = channel.recv() => {
                let Some(output) = output else {
                    break;
                };
                stdout.write_all(&output).await.context("failed to write stdout")?;
                stdout.flush().await.context("failed to flush stdout")?;
            }
            _ = resize_check.tick() => {
                let Ok((cols, rows)) = crossterm::terminal::size() else {
                    continue;
                };
                if last_size != Some((cols, rows)) {
                    last_size = Some((cols, rows));
                    channel.resize(TerminalSize { cols, rows }).await?;
                }
            }
        }
    }

    channel.close().await;
    Ok(())
}

/// Feeds stdin lines to the terminal as client frames, so a resize line
/// like `{"type":"resize","cols":120,"rows":40}` never reaches the shell.
async fn pump_frames(mut channel: TerminalChannel) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read frame")? else {
                    break;
                };
                channel.handle_frame(&format!("{line}\n")).await?;
            }
            output = channel.recv() => {
                let Some(output) = output else {
                    break;
                };
                stdout.write_all(&output).await.context("failed to write stdout")?;
                stdout.flush().await.context("failed to flush stdout")?;
            }
        }
    }

    channel.close().await;
    Ok(())
}

fn bookmarks(engine: &Engine, action: BookmarkAction) -> Result<()> {
    let store = engine.bookmarks();
    match action {
        BookmarkAction::List => {
            for bookmark in store.list() {
                println!(
                    "{:>4}  {}  {}",
                    bookmark.id,
                    bookmark.label(),
                    bookmark.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        BookmarkAction::Add {
            cluster,
            namespace,
            kind,
        } => {
            let (bookmark, created) = store.add(&cluster, &namespace, &kind)?;
            if created {
                println!("bookmark {} added: {}", bookmark.id, bookmark.label());
            } else {
                println!("already bookmarked as {}", bookmark.id);
            }
        }
        BookmarkAction::Remove { id } => {
            if !store.remove(id)? {
                bail!("no bookmark with id {id}");
            }
            println!("bookmark {id} removed");
        }
    }
    Ok(())
}

fn groups(engine: &Engine, action: GroupAction) -> Result<()> {
    let store = engine.groups();
    let groups = match action {
        GroupAction::List => store.snapshot(),
        GroupAction::Create { name, kinds } => store.create_group(&name, &kinds)?,
        GroupAction::Update {
            name,
            rename,
            kinds,
        } => {
            let new_name = rename.unwrap_or_else(|| name.clone());
            store.update_group(&name, &new_name, &kinds)?
        }
        GroupAction::Delete { name } => store.delete_group(&name)?,
    };
    print_groups(&groups);
    Ok(())
}

async fn read_prompt(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut body = String::new();
        tokio::io::stdin()
            .read_to_string(&mut body)
            .await
            .context("failed to read prompt from stdin")?;
        return Ok(body);
    }

    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read prompt {}", path.display()))
}

fn print_groups(groups: &KindGroups) {
    let mut stdout = std::io::stdout().lock();
    for (name, kinds) in &groups.groups {
        let _ = writeln!(stdout, "{name}: {}", kinds.join(", "));
    }
    if !groups.uncategorized.is_empty() {
        let _ = writeln!(stdout, "Uncategorized: {}", groups.uncategorized.join(", "));
    }
}

fn print_instances(items: &[ResourceInstance]) {
    for item in items {
        let namespace = item.namespace.as_deref().unwrap_or("-");
        match &item.details {
            InstanceDetails::Pod {
                status,
                ready,
                restarts,
                ..
            } => println!(
                "{:<48} {:<16} {:<6} {:<20} {:<4} {}",
                item.name, namespace, ready, status, restarts, item.age
            ),
            InstanceDetails::Deployment {
                ready, up_to_date, ..
            } => println!(
                "{:<48} {:<16} {:<8} {:<4} {}",
                item.name, namespace, ready, up_to_date, item.age
            ),
            InstanceDetails::Generic => {
                println!("{:<48} {:<16} {}", item.name, namespace, item.age)
            }
        }
    }
}

fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}
