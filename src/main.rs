use std::error::Error;
use std::sync::Arc;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

mod cli;
mod config;
mod handlers;
mod llm;
mod state;
mod stylist;
mod utils;

use cli::{parse_style_args, run_style};
use config::CONFIG;
use handlers::{intake, stylist as commands};
use llm::GeminiImageEditor;
use state::{AppState, IntakeTarget};
use stylist::Intensity;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Base,
    Item,
    Items,
    Remove(String),
    Clearbase,
    Intensity(String),
    Generate,
    Session,
    Reset,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging(&CONFIG.log_level);

    let editor = Arc::new(GeminiImageEditor::from_config(&CONFIG));

    let args: Vec<String> = std::env::args().collect();
    if let Some(style_args) = parse_style_args(&args)? {
        let output_path = run_style(style_args, editor.as_ref()).await?;
        info!("Styled image written to {}", output_path.display());
        println!("{}", output_path.display());
        return Ok(());
    }

    if CONFIG.bot_token.trim().is_empty() {
        return Err("BOT_TOKEN is required unless running style".into());
    }

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!(
        model = %CONFIG.gemini_image_model,
        "Starting virtual stylist bot"
    );

    let state = AppState::new(editor, Intensity::new(CONFIG.default_style_intensity));

    handlers::access::load_whitelist();

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(
            dptree::filter(|msg: Message| intake::message_has_upload(&msg))
                .endpoint(handle_upload),
        )
        .endpoint(ignore_message);

    let callback_state = state.clone();
    let callback_handler =
        Update::filter_callback_query().endpoint(move |bot: Bot, query: CallbackQuery| {
            let state = callback_state.clone();
            async move { handle_callback_query(bot, state, query).await }
        });

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    fn optional_arg(arg: String) -> Option<String> {
        if arg.trim().is_empty() {
            None
        } else {
            Some(arg.trim().to_string())
        }
    }

    match command {
        Command::Start => commands::start_handler(bot, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Base => intake::intake_from_reply(bot, state, message, IntakeTarget::Base).await?,
        Command::Item => intake::intake_from_reply(bot, state, message, IntakeTarget::Item).await?,
        Command::Items => commands::items_handler(bot, state, message).await?,
        Command::Remove(arg) => {
            commands::remove_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::Clearbase => commands::clearbase_handler(bot, state, message).await?,
        Command::Intensity(arg) => {
            commands::intensity_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::Generate => {
            tokio::spawn(async move {
                if let Err(err) = commands::generate_handler(bot, state, message).await {
                    error!("generate handler failed: {err}");
                }
            });
        }
        Command::Session => commands::session_handler(bot, state, message).await?,
        Command::Reset => commands::reset_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    if commands::is_stylist_callback(data) {
        tokio::spawn(async move {
            if let Err(err) = commands::stylist_callback(bot, state, query).await {
                error!("stylist callback failed: {err}");
            }
        });
    }
    Ok(())
}

async fn handle_upload(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    if let Err(err) = intake::handle_upload(bot, state, message).await {
        error!("upload handler failed: {err}");
    }
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
