use std::time::Instant;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{FileId, ReplyParameters};
use tracing::{debug, info, warn};

use crate::config::CONFIG;
use crate::handlers::access::check_access_control;
use crate::llm::media::download_media;
use crate::state::{AppState, IntakeTarget};
use crate::stylist::intake::{is_image_mime, ADVERTISED_UPLOAD_TYPES};
use crate::stylist::session::SessionSummary;
use crate::stylist::{ingest_file, IncomingFile, StyleSession, UploadedImage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Base { replaced: bool },
    Item { id: String },
    ItemLimitReached,
}

#[derive(Debug, Clone)]
struct TelegramImageSource {
    file_id: FileId,
    file_name: String,
    declared_mime: Option<String>,
}

/// Reads `/base` or `/item` from a caption, with or without a `@bot` suffix.
pub fn caption_target(text: &str) -> Option<IntakeTarget> {
    let first = text.split_whitespace().next()?;
    let command = first.strip_prefix('/')?;
    let command = command.split('@').next().unwrap_or(command);
    match command.to_ascii_lowercase().as_str() {
        "base" => Some(IntakeTarget::Base),
        "item" | "items" => Some(IntakeTarget::Item),
        _ => None,
    }
}

/// Without an explicit target an image fills the base slot when it is empty
/// and becomes an item otherwise.
pub fn place_image(
    session: &mut StyleSession,
    target: Option<IntakeTarget>,
    image: UploadedImage,
    max_items: usize,
) -> Placement {
    let target = target.unwrap_or(if session.base_image().is_none() {
        IntakeTarget::Base
    } else {
        IntakeTarget::Item
    });
    match target {
        IntakeTarget::Base => Placement::Base {
            replaced: session.set_base_image(image).is_some(),
        },
        IntakeTarget::Item if session.item_images().len() >= max_items => {
            Placement::ItemLimitReached
        }
        IntakeTarget::Item => Placement::Item {
            id: session.add_item_image(image),
        },
    }
}

pub fn readiness_hint(summary: &SessionSummary) -> String {
    if summary.base_image.is_none() {
        "Next: send a photo of the person with the caption /base.".to_string()
    } else if summary.item_ids.is_empty() {
        "Next: send clothing or accessory photos with the caption /item.".to_string()
    } else {
        format!(
            "Ready: /generate at intensity {} ({}).",
            summary.intensity,
            summary.intensity.realism_level().label()
        )
    }
}

pub fn describe_placement(
    placement: &Placement,
    file_name: &str,
    summary: &SessionSummary,
    max_items: usize,
) -> String {
    let head = match placement {
        Placement::Base { replaced: false } => format!("Base photo set ({file_name})."),
        Placement::Base { replaced: true } => format!("Base photo replaced ({file_name})."),
        Placement::Item { id } => format!(
            "Added item {id} ({}/{max_items}).",
            summary.item_ids.len()
        ),
        Placement::ItemLimitReached => {
            return format!(
                "Item limit reached ({max_items}). Remove one from /items before adding more."
            )
        }
    };
    format!("{head}\n{}", readiness_hint(summary))
}

fn image_source(message: &Message) -> Option<TelegramImageSource> {
    if let Some(photo) = message.photo().and_then(|sizes| sizes.last()) {
        return Some(TelegramImageSource {
            file_id: photo.file.id.clone(),
            file_name: format!("photo-{}", message.id.0),
            declared_mime: None,
        });
    }

    let document = message.document()?;
    Some(TelegramImageSource {
        file_id: document.file.id.clone(),
        file_name: document
            .file_name
            .clone()
            .unwrap_or_else(|| format!("document-{}", message.id.0)),
        declared_mime: document
            .mime_type
            .as_ref()
            .map(|mime| mime.essence_str().to_string()),
    })
}

pub fn message_has_upload(message: &Message) -> bool {
    message.photo().is_some() || message.document().is_some()
}

pub async fn get_file_url(bot: &Bot, file_id: &FileId) -> Result<String> {
    let file = bot.get_file(file_id.clone()).await?;
    Ok(format!(
        "https://api.telegram.org/file/bot{}/{}",
        CONFIG.bot_token, file.path
    ))
}

async fn fetch_upload(bot: &Bot, source: TelegramImageSource) -> Result<IncomingFile> {
    let url = get_file_url(bot, &source.file_id).await?;
    let bytes = download_media(&url, &source.file_name).await?;
    Ok(IncomingFile::new(source.file_name, source.declared_mime, bytes))
}

async fn reply(bot: &Bot, message: &Message, text: String) -> Result<()> {
    bot.send_message(message.chat.id, text)
        .reply_parameters(ReplyParameters::new(message.id))
        .await?;
    Ok(())
}

fn unsupported_upload_text() -> String {
    format!(
        "That file is not an image. Supported uploads: {}.",
        ADVERTISED_UPLOAD_TYPES.join(", ")
    )
}

/// Downloads and ingests the image carried by `source_message`, then places
/// it in the chat's session. Returns the placement when an image was stored.
async fn store_upload(
    bot: &Bot,
    state: &AppState,
    source_message: &Message,
    reply_to: &Message,
    target: Option<IntakeTarget>,
) -> Result<Option<Placement>> {
    let Some(source) = image_source(source_message) else {
        reply(
            bot,
            reply_to,
            "Reply to a photo or image file, or send one with this command as its caption."
                .to_string(),
        )
        .await?;
        return Ok(None);
    };

    if let Some(declared) = source.declared_mime.as_deref() {
        if !is_image_mime(declared) {
            debug!(mime = declared, file = %source.file_name, "Skipping non-image upload");
            reply(bot, reply_to, unsupported_upload_text()).await?;
            return Ok(None);
        }
    }

    let incoming = match fetch_upload(bot, source).await {
        Ok(incoming) => incoming,
        Err(err) => {
            warn!("Failed to fetch upload: {err}");
            reply(
                bot,
                reply_to,
                "Sorry, I couldn't download that file. Please try again.".to_string(),
            )
            .await?;
            return Ok(None);
        }
    };

    let Some(image) = ingest_file(incoming).await else {
        reply(bot, reply_to, unsupported_upload_text()).await?;
        return Ok(None);
    };

    let file_name = image.file_name().to_string();
    let max_items = CONFIG.max_item_images;
    let chat_id = reply_to.chat.id.0;
    let (placement, summary) = state.sessions.with_session(chat_id, |session| {
        let placement = place_image(session, target, image, max_items);
        (placement, session.summary())
    });
    info!(chat_id, file = %file_name, placement = ?placement, "Stored upload");

    reply(
        bot,
        reply_to,
        describe_placement(&placement, &file_name, &summary, max_items),
    )
    .await?;
    Ok(Some(placement))
}

fn access_command(target: Option<IntakeTarget>) -> &'static str {
    match target {
        Some(IntakeTarget::Base) => "base",
        _ => "item",
    }
}

/// `/base` or `/item` sent as text in reply to an image.
pub async fn intake_from_reply(
    bot: Bot,
    state: AppState,
    message: Message,
    target: IntakeTarget,
) -> Result<()> {
    if !check_access_control(&bot, &message, access_command(Some(target))).await {
        return Ok(());
    }

    match message.reply_to_message() {
        Some(source) => {
            store_upload(&bot, &state, source, &message, Some(target)).await?;
        }
        None => {
            let usage = match target {
                IntakeTarget::Base => "Send a photo of the person with the caption /base, or reply to one with /base.",
                IntakeTarget::Item => "Send clothing or accessory photos with the caption /item, or reply to one with /item.",
            };
            reply(&bot, &message, usage.to_string()).await?;
        }
    }
    Ok(())
}

/// Photos and documents, single or in albums.
pub async fn handle_upload(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let explicit = message.caption().and_then(caption_target);

    let Some(group) = message.media_group_id().cloned() else {
        if !check_access_control(&bot, &message, access_command(explicit)).await {
            return Ok(());
        }
        store_upload(&bot, &state, &message, &message, explicit).await?;
        return Ok(());
    };

    let (target, base_taken) = {
        let mut routes = state.album_routes.lock();
        let target = routes.resolve(&group, explicit, Instant::now());
        (target, routes.base_taken(&group))
    };
    if target == Some(IntakeTarget::Base) && base_taken {
        debug!(chat_id = message.chat.id.0, "Ignoring extra image in base album");
        return Ok(());
    }
    if !check_access_control(&bot, &message, access_command(target)).await {
        return Ok(());
    }

    let placement = store_upload(&bot, &state, &message, &message, target).await?;
    if target == Some(IntakeTarget::Base) && matches!(placement, Some(Placement::Base { .. })) {
        state.album_routes.lock().mark_base_taken(&group);
    }
    Ok(())
}
