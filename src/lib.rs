mod app;
mod domain;
mod infra;
mod shared;
mod stream;

pub(crate) use app::notice;
pub(crate) use infra::{app_paths, chat_api, db, pending_store, preferences, settings};
pub(crate) use shared::blocking;

pub use app::app_state::ChatContext;
pub use app::cli::Cli;
pub use app::notice::{NoticeLevel, NoticePayload, Notifier, TerminalNotifier};
pub use app::terminal::TerminalSink;
pub use domain::{content, conversations, generation, markup, resume};
pub use infra::chat_api::{ChatApi, ChatApiConfig, ConversationInfo, FreeUsageInfo, PointsInfo};
pub use infra::pending_store::PendingRecord;
pub use infra::settings::{ClientSettings, RetryBackoff};
pub use stream::{decoder, retry, session, sink};

use clap::Parser;

pub fn run() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("错误: 无法启动 tokio 运行时: {err}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(app::cli::execute(cli));
    drop(runtime);

    if let Err(err) = result {
        tracing::error!("运行失败: {}", err);
        eprintln!("错误: {err}");
        app::logging::shutdown();
        std::process::exit(1);
    }
    app::logging::shutdown();
}
