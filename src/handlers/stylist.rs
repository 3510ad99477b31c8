use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ReplyParameters,
};
use tracing::{error, info, warn};

use crate::handlers::access::{check_access_control, is_rate_limited, message_user_id};
use crate::state::AppState;
use crate::stylist::prompt::MAX_INTENSITY;
use crate::stylist::session::SessionSummary;
use crate::stylist::{finish_generation, start_generation, GenerateOutcome, GenerateRejection, Intensity};
use crate::utils::telegram::{send_document_with_retry, start_chat_action_heartbeat};
use crate::utils::timing::start_command_timer;

pub const REMOVE_ITEM_CALLBACK_PREFIX: &str = "rm:";
pub const INTENSITY_CALLBACK_PREFIX: &str = "intensity:";
const INTENSITY_PRESETS: [u8; 5] = [0, 25, 50, 75, 100];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StylistCallback {
    RemoveItem(String),
    SetIntensity(Intensity),
}

pub fn parse_callback(data: &str) -> Option<StylistCallback> {
    if let Some(id) = data.strip_prefix(REMOVE_ITEM_CALLBACK_PREFIX) {
        if id.is_empty() {
            return None;
        }
        return Some(StylistCallback::RemoveItem(id.to_string()));
    }
    if let Some(value) = data.strip_prefix(INTENSITY_CALLBACK_PREFIX) {
        return parse_intensity_arg(value).ok().map(StylistCallback::SetIntensity);
    }
    None
}

pub fn is_stylist_callback(data: &str) -> bool {
    data.starts_with(REMOVE_ITEM_CALLBACK_PREFIX) || data.starts_with(INTENSITY_CALLBACK_PREFIX)
}

pub fn parse_intensity_arg(arg: &str) -> Result<Intensity, String> {
    let trimmed = arg.trim().trim_end_matches('%');
    match trimmed.parse::<u32>() {
        Ok(value) if value <= u32::from(MAX_INTENSITY) => Ok(Intensity::new(value as u8)),
        _ => Err(format!(
            "Intensity must be a whole number from 0 to {MAX_INTENSITY}."
        )),
    }
}

fn build_intensity_keyboard(current: Intensity) -> InlineKeyboardMarkup {
    let buttons = INTENSITY_PRESETS
        .iter()
        .map(|preset| {
            let label = if *preset == current.value() {
                format!("• {preset}")
            } else {
                preset.to_string()
            };
            InlineKeyboardButton::callback(label, format!("{INTENSITY_CALLBACK_PREFIX}{preset}"))
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(vec![buttons])
}

fn build_items_keyboard(item_ids: &[String]) -> InlineKeyboardMarkup {
    let rows = item_ids
        .iter()
        .map(|id| {
            vec![InlineKeyboardButton::callback(
                format!("Remove {id}"),
                format!("{REMOVE_ITEM_CALLBACK_PREFIX}{id}"),
            )]
        })
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

fn intensity_text(intensity: Intensity) -> String {
    format!(
        "Style intensity: {intensity} ({}).",
        intensity.realism_level().label()
    )
}

pub fn format_items(item_ids: &[String]) -> String {
    if item_ids.is_empty() {
        return "No item images yet. Send photos with the caption /item.".to_string();
    }
    let mut text = format!("Item images ({}):", item_ids.len());
    for (index, id) in item_ids.iter().enumerate() {
        text.push_str(&format!("\n{}. {}", index + 1, id));
    }
    text
}

pub fn format_session(summary: &SessionSummary) -> String {
    let mut text = format!(
        "Base photo: {}\n{}\n{}\nStatus: {}",
        summary.base_image.as_deref().unwrap_or("none"),
        format_items(&summary.item_ids),
        intensity_text(summary.intensity),
        summary.phase
    );
    if let Some(file_name) = &summary.result_file {
        text.push_str(&format!("\nLast result: {file_name}"));
    }
    if let Some(err) = &summary.validation_error {
        text.push_str(&format!("\nLast problem: {err}"));
    }
    if summary.can_generate {
        text.push_str("\nReady to /generate.");
    }
    text
}

fn rejection_text(rejection: GenerateRejection) -> String {
    match rejection {
        GenerateRejection::InFlight => {
            "A styled image is already being generated. Please wait for it to finish.".to_string()
        }
        GenerateRejection::Invalid(err) => err.to_string(),
    }
}

async fn reply(bot: &Bot, message: &Message, text: String) -> Result<Message> {
    Ok(bot
        .send_message(message.chat.id, text)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?)
}

pub async fn start_handler(bot: Bot, message: Message) -> Result<()> {
    reply(
        &bot,
        &message,
        "Hello! I am your virtual stylist. Send a photo of yourself with /base, add clothing or accessories with /item, then /generate. Use /help to see commands.".to_string(),
    )
    .await?;
    Ok(())
}

#[allow(deprecated)]
pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "help").await {
        return Ok(());
    }

    let help_text = "
*Virtual Stylist Commands*

/base - Set the photo of the person to dress
Usage: send a photo with the caption `/base`, or reply to a photo with `/base`

/item - Add a clothing or accessory image
Usage: send photos (albums work too) with the caption `/item`, or reply to a photo with `/item`

Photos sent without a caption fill the base slot first, then become items.

/items - List item images with remove buttons

/remove - Remove one item image
Usage: `/remove [item id]`

/clearbase - Remove the base photo

/intensity - Set how creative the result may be
Usage: `/intensity [0-100]`. 0-30 keeps the photo strictly unchanged, 31-70 balances realism, 71-100 allows creative changes

/generate - Apply the items to the base photo

/session - Show the current images, intensity and status

/reset - Clear all images and start over

/help - Show this help message
";

    bot.send_message(message.chat.id, help_text)
        .reply_parameters(ReplyParameters::new(message.id))
        .parse_mode(ParseMode::Markdown)
        .await?;
    Ok(())
}

pub async fn items_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "items").await {
        return Ok(());
    }

    let item_ids = state
        .sessions
        .with_session(message.chat.id.0, |session| session.summary().item_ids);
    let mut request = bot
        .send_message(message.chat.id, format_items(&item_ids))
        .reply_parameters(ReplyParameters::new(message.id));
    if !item_ids.is_empty() {
        request = request.reply_markup(build_items_keyboard(&item_ids));
    }
    request.await?;
    Ok(())
}

pub async fn remove_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    id: Option<String>,
) -> Result<()> {
    if !check_access_control(&bot, &message, "remove").await {
        return Ok(());
    }

    let Some(id) = id else {
        reply(
            &bot,
            &message,
            "Usage: /remove [item id]. Use /items to see ids.".to_string(),
        )
        .await?;
        return Ok(());
    };

    let removed = state
        .sessions
        .with_session(message.chat.id.0, |session| session.remove_item_image(&id));
    let text = if removed {
        format!("Removed item {id}.")
    } else {
        format!("No item with id {id}.")
    };
    reply(&bot, &message, text).await?;
    Ok(())
}

pub async fn clearbase_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "clearbase").await {
        return Ok(());
    }

    let cleared = state
        .sessions
        .with_session(message.chat.id.0, |session| session.clear_base_image());
    let text = match cleared {
        Some(image) => format!("Base photo {} removed.", image.file_name()),
        None => "There is no base photo to remove.".to_string(),
    };
    reply(&bot, &message, text).await?;
    Ok(())
}

pub async fn intensity_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    arg: Option<String>,
) -> Result<()> {
    if !check_access_control(&bot, &message, "intensity").await {
        return Ok(());
    }

    let chat_id = message.chat.id.0;
    let Some(arg) = arg else {
        let current = state
            .sessions
            .with_session(chat_id, |session| session.intensity());
        bot.send_message(
            message.chat.id,
            format!("{}\nPick a preset or send /intensity [0-100].", intensity_text(current)),
        )
        .reply_parameters(ReplyParameters::new(message.id))
        .reply_markup(build_intensity_keyboard(current))
        .await?;
        return Ok(());
    };

    match parse_intensity_arg(&arg) {
        Ok(intensity) => {
            state
                .sessions
                .with_session(chat_id, |session| session.set_intensity(intensity));
            reply(&bot, &message, intensity_text(intensity)).await?;
        }
        Err(err) => {
            reply(&bot, &message, err).await?;
        }
    }
    Ok(())
}

pub async fn session_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "session").await {
        return Ok(());
    }

    let summary = state
        .sessions
        .with_session(message.chat.id.0, |session| session.summary());
    reply(&bot, &message, format_session(&summary)).await?;
    Ok(())
}

pub async fn reset_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "reset").await {
        return Ok(());
    }

    state
        .sessions
        .with_session(message.chat.id.0, |session| session.reset());
    info!(chat_id = message.chat.id.0, "Session reset");
    reply(
        &bot,
        &message,
        "Session cleared. Send a new base photo to start again.".to_string(),
    )
    .await?;
    Ok(())
}

async fn edit_status(bot: &Bot, chat_id: ChatId, message_id: Option<MessageId>, text: String) {
    let Some(message_id) = message_id else {
        return;
    };
    if let Err(err) = bot.edit_message_text(chat_id, message_id, text).await {
        warn!("Failed to update status message: {err}");
    }
}

pub async fn generate_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "generate").await {
        return Ok(());
    }

    let mut timer = start_command_timer("generate", &message);
    let chat_id = message.chat.id.0;

    // Only attempts that would reach the service count against the limit.
    let ready = state
        .sessions
        .with_session(chat_id, |session| session.can_generate());
    if ready && is_rate_limited(message_user_id(&message)) {
        timer.complete("rate_limited", None);
        reply(
            &bot,
            &message,
            "Rate limit exceeded. Please try again later.".to_string(),
        )
        .await?;
        return Ok(());
    }

    let ticket = match start_generation(&state.sessions, chat_id) {
        Ok(ticket) => ticket,
        Err(rejection) => {
            timer.complete("rejected", Some(format!("{rejection:?}")));
            reply(&bot, &message, rejection_text(rejection)).await?;
            return Ok(());
        }
    };

    // The session is loading from here on; every path below must settle it.
    let intensity = state
        .sessions
        .with_session(chat_id, |session| session.intensity());
    let processing = match reply(
        &bot,
        &message,
        format!(
            "Styling your photo with {} item(s) at intensity {} ({})...",
            ticket.request.items.len(),
            intensity,
            intensity.realism_level().label()
        ),
    )
    .await
    {
        Ok(sent) => Some(sent.id),
        Err(err) => {
            warn!("Failed to send status message: {err}");
            None
        }
    };

    let outcome = {
        let _chat_action =
            start_chat_action_heartbeat(bot.clone(), message.chat.id, ChatAction::UploadPhoto);
        finish_generation(&state.sessions, chat_id, ticket, state.editor.as_ref()).await
    };

    match outcome {
        GenerateOutcome::Succeeded(image) => {
            let bytes = match image.decode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!("Generated image could not be decoded: {err}");
                    timer.complete("error", Some("decode".to_string()));
                    edit_status(
                        &bot,
                        message.chat.id,
                        processing,
                        "Failed to generate image. Please try again later.".to_string(),
                    )
                    .await;
                    return Ok(());
                }
            };
            let file_name = image.download_file_name();
            if let Err(err) = send_document_with_retry(
                &bot,
                message.chat.id,
                &bytes,
                &file_name,
                "Here is your styled image.",
                Some(message.id),
            )
            .await
            {
                error!("Failed to deliver styled image: {err}");
                timer.complete("error", Some("delivery".to_string()));
                edit_status(
                    &bot,
                    message.chat.id,
                    processing,
                    "The image was generated but could not be sent. Please try /generate again."
                        .to_string(),
                )
                .await;
                return Ok(());
            }
            edit_status(&bot, message.chat.id, processing, "Done.".to_string()).await;
            timer.complete("success", Some(file_name));
        }
        GenerateOutcome::Failed(err) => {
            timer.complete("error", Some(err.to_string()));
            edit_status(&bot, message.chat.id, processing, err.to_string()).await;
        }
        GenerateOutcome::Discarded => {
            timer.complete("discarded", None);
            edit_status(
                &bot,
                message.chat.id,
                processing,
                "The session was reset, so this result was discarded.".to_string(),
            )
            .await;
        }
        GenerateOutcome::Rejected(rejection) => {
            timer.complete("rejected", Some(format!("{rejection:?}")));
            edit_status(&bot, message.chat.id, processing, rejection_text(rejection)).await;
        }
    }
    Ok(())
}

pub async fn stylist_callback(bot: Bot, state: AppState, query: CallbackQuery) -> Result<()> {
    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Some(message) = &query.message else {
        let _ = bot.answer_callback_query(query.id.clone()).await;
        return Ok(());
    };
    let chat_id = message.chat().id;

    match parse_callback(data) {
        Some(StylistCallback::RemoveItem(id)) => {
            let (removed, item_ids) = state.sessions.with_session(chat_id.0, |session| {
                let removed = session.remove_item_image(&id);
                (removed, session.summary().item_ids)
            });
            let notice = if removed {
                format!("Removed {id}")
            } else {
                "Already removed".to_string()
            };
            let _ = bot.answer_callback_query(query.id.clone()).text(notice).await;
            let mut edit = bot.edit_message_text(chat_id, message.id(), format_items(&item_ids));
            if !item_ids.is_empty() {
                edit = edit.reply_markup(build_items_keyboard(&item_ids));
            }
            edit.await?;
        }
        Some(StylistCallback::SetIntensity(intensity)) => {
            state
                .sessions
                .with_session(chat_id.0, |session| session.set_intensity(intensity));
            let _ = bot.answer_callback_query(query.id.clone()).await;
            bot.edit_message_text(chat_id, message.id(), intensity_text(intensity))
                .reply_markup(build_intensity_keyboard(intensity))
                .await?;
        }
        None => {
            let _ = bot.answer_callback_query(query.id.clone()).await;
        }
    }
    Ok(())
}
