//! Usage: Command-line entry (`chat-stream [OPTIONS] [PROMPT]...`): resume pending generations, send one prompt.

use super::app_state::{image_attachment_from_file, ChatContext};
use super::notice::{NoticeLevel, Notifier, TerminalNotifier};
use super::terminal::TerminalSink;
use super::{cleanup, logging};
use crate::domain::generation::GenerationRequest;
use crate::stream::session::SessionOutcome;
use crate::{app_paths, blocking, db, settings};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Streaming chat client for the generate API.
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct Cli {
    /// Conversation to post into. A new conversation is created when omitted.
    #[arg(long = "conversation", short = 'c', value_name = "ID")]
    pub conversation: Option<String>,

    /// Model to use; also remembered as the selected model.
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Ask the server to search the web before answering.
    #[arg(long = "search", default_value_t = false)]
    pub search: bool,

    /// Image to attach to the prompt.
    #[arg(long = "image", short = 'i', value_name = "FILE")]
    pub image: Option<PathBuf>,

    /// Print reasoning text as it streams.
    #[arg(long = "show-think", default_value_t = false)]
    pub show_think: bool,

    /// Skip reattaching to generations left pending by an earlier run.
    #[arg(long = "no-resume", default_value_t = false)]
    pub no_resume: bool,

    /// Import a pending list exported from the web client before resuming.
    #[arg(long = "import-pending", value_name = "FILE")]
    pub import_pending: Option<PathBuf>,

    /// Prompt text; words are joined with spaces.
    pub prompt: Vec<String>,
}

pub(crate) async fn execute(cli: Cli) -> Result<(), String> {
    let app_dir = app_paths::app_data_dir()?;

    let dir = app_dir.clone();
    let client_settings = blocking::run("settings_read", move || settings::read(&dir)).await?;
    logging::init(Some(&app_dir), &client_settings.log_level);

    let dir = app_dir.clone();
    let db = blocking::run("db_init", move || db::init(&dir)).await?;
    let notifier: Arc<dyn Notifier> = Arc::new(TerminalNotifier);
    let ctx = ChatContext::from_parts(app_dir, client_settings, db, Arc::clone(&notifier))?;

    let slot = ctx.session().abort_slot();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到 Ctrl-C，正在中断生成");
            cleanup::abort_and_wait(&slot).await;
        }
    });

    let mut sink = TerminalSink::new(std::io::stdout(), cli.show_think);

    if let Some(path) = cli.import_pending.as_deref() {
        let imported = ctx.import_legacy_pending(path).await?;
        notifier.notify(NoticeLevel::Info, &format!("已导入 {imported} 条待恢复记录"));
    }

    if !cli.no_resume {
        let report = ctx.resume_pending(&mut sink).await;
        if report.resumed > 0 {
            println!();
        }
    }

    if let Some(model) = cli.model.as_deref() {
        ctx.select_model(model).await?;
    }

    let prompt = cli.prompt.join(" ");
    if prompt.trim().is_empty() && cli.image.is_none() {
        return Ok(());
    }

    let image = match cli.image.as_deref() {
        Some(path) => {
            let path = path.to_path_buf();
            Some(blocking::run("image_read", move || image_attachment_from_file(&path)).await?)
        }
        None => None,
    };

    let conversation_id = match cli.conversation {
        Some(id) => id,
        None => ctx.new_conversation().await?.id,
    };
    let model = ctx.selected_model().await;

    let mut request = GenerationRequest::new(conversation_id, model, prompt);
    request.online_search = cli.search;
    request.image = image;

    let result = ctx.send(&request, &mut sink).await;
    println!();
    cleanup::abort_and_wait(&ctx.session().abort_slot()).await;

    match result {
        Ok(SessionOutcome::Completed(_)) => Ok(()),
        Ok(SessionOutcome::Aborted(aborted)) => {
            if !aborted.saved {
                notifier.notify(NoticeLevel::Warning, "中断的响应未能保存到服务器");
            }
            Ok(())
        }
        Err(err) => Err(err.to_string()),
    }
}
