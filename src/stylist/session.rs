use crate::llm::{GeneratedImage, GenerationError, InlineImage, StyleEditRequest};
use crate::stylist::intake::UploadedImage;
use crate::stylist::prompt::{build_prompt, Intensity};

pub const DEFAULT_INTENSITY: u8 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Please upload a base image and at least one item image.")]
    MissingBaseImage,
    #[error("Please upload a base image and at least one item image.")]
    MissingItemImages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateRejection {
    /// A request is already outstanding; the trigger is ignored.
    InFlight,
    Invalid(ValidationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Loading,
    Succeeded(GeneratedImage),
    Failed(String),
}

impl RequestPhase {
    pub fn label(&self) -> &'static str {
        match self {
            RequestPhase::Idle => "idle",
            RequestPhase::Loading => "generating",
            RequestPhase::Succeeded(_) => "done",
            RequestPhase::Failed(_) => "failed",
        }
    }
}

/// Issued when a generation starts. Its sequence number decides whether the
/// eventual result is still wanted.
#[derive(Debug, Clone)]
pub struct GenerationTicket {
    pub sequence: u64,
    pub request: StyleEditRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied,
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub base_image: Option<String>,
    pub item_ids: Vec<String>,
    pub intensity: Intensity,
    pub phase: &'static str,
    pub result_file: Option<String>,
    pub validation_error: Option<String>,
    pub can_generate: bool,
}

#[derive(Debug, Clone)]
pub struct StyleSession {
    base_image: Option<UploadedImage>,
    item_images: Vec<UploadedImage>,
    intensity: Intensity,
    phase: RequestPhase,
    validation_error: Option<ValidationError>,
    issued_sequence: u64,
}

impl Default for StyleSession {
    fn default() -> Self {
        Self::new(Intensity::new(DEFAULT_INTENSITY))
    }
}

fn inline_image(image: &UploadedImage) -> InlineImage {
    InlineImage {
        mime_type: image.mime_type().to_string(),
        data: image.base64_data().to_string(),
        file_name: image.file_name().to_string(),
    }
}

impl StyleSession {
    pub fn new(intensity: Intensity) -> Self {
        Self {
            base_image: None,
            item_images: Vec::new(),
            intensity,
            phase: RequestPhase::Idle,
            validation_error: None,
            issued_sequence: 0,
        }
    }

    pub fn base_image(&self) -> Option<&UploadedImage> {
        self.base_image.as_ref()
    }

    pub fn item_images(&self) -> &[UploadedImage] {
        &self.item_images
    }

    pub fn intensity(&self) -> Intensity {
        self.intensity
    }

    pub fn phase(&self) -> &RequestPhase {
        &self.phase
    }

    pub fn validation_error(&self) -> Option<ValidationError> {
        self.validation_error
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, RequestPhase::Loading)
    }

    pub fn result(&self) -> Option<&GeneratedImage> {
        match &self.phase {
            RequestPhase::Succeeded(image) => Some(image),
            _ => None,
        }
    }

    /// Fills the single base slot, returning the image it replaced.
    pub fn set_base_image(&mut self, image: UploadedImage) -> Option<UploadedImage> {
        self.base_image.replace(image)
    }

    pub fn clear_base_image(&mut self) -> Option<UploadedImage> {
        self.base_image.take()
    }

    /// Appends an item and returns the identifier it is stored under.
    pub fn add_item_image(&mut self, mut image: UploadedImage) -> String {
        if self.has_item(&image.id) {
            let mut suffix = 2usize;
            let mut candidate = format!("{}-{}", image.id, suffix);
            while self.has_item(&candidate) {
                suffix += 1;
                candidate = format!("{}-{}", image.id, suffix);
            }
            image.id = candidate;
        }
        let id = image.id.clone();
        self.item_images.push(image);
        id
    }

    fn has_item(&self, id: &str) -> bool {
        self.item_images.iter().any(|item| item.id() == id)
    }

    pub fn remove_item_image(&mut self, id: &str) -> bool {
        match self.item_images.iter().position(|item| item.id() == id) {
            Some(index) => {
                self.item_images.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn set_intensity(&mut self, intensity: Intensity) {
        self.intensity = intensity;
    }

    pub fn can_generate(&self) -> bool {
        self.base_image.is_some() && !self.item_images.is_empty() && !self.is_loading()
    }

    /// Moves the session into `Loading` and hands out the request to send.
    /// Prior results and errors are cleared in the same step.
    pub fn begin_generation(&mut self) -> Result<GenerationTicket, GenerateRejection> {
        if self.is_loading() {
            return Err(GenerateRejection::InFlight);
        }
        let Some(base_image) = self.base_image.as_ref() else {
            self.validation_error = Some(ValidationError::MissingBaseImage);
            return Err(GenerateRejection::Invalid(ValidationError::MissingBaseImage));
        };
        if self.item_images.is_empty() {
            self.validation_error = Some(ValidationError::MissingItemImages);
            return Err(GenerateRejection::Invalid(ValidationError::MissingItemImages));
        }

        let request = StyleEditRequest {
            base: inline_image(base_image),
            items: self.item_images.iter().map(inline_image).collect(),
            prompt: build_prompt(self.intensity),
        };

        self.validation_error = None;
        self.phase = RequestPhase::Loading;
        self.issued_sequence += 1;

        Ok(GenerationTicket {
            sequence: self.issued_sequence,
            request,
        })
    }

    pub fn complete_generation(
        &mut self,
        sequence: u64,
        result: Result<GeneratedImage, GenerationError>,
    ) -> Completion {
        if sequence != self.issued_sequence || !self.is_loading() {
            return Completion::Stale;
        }
        self.phase = match result {
            Ok(image) => RequestPhase::Succeeded(image),
            Err(err) => RequestPhase::Failed(err.to_string()),
        };
        Completion::Applied
    }

    /// Drops all images and any outstanding result. Intensity is kept.
    pub fn reset(&mut self) {
        self.base_image = None;
        self.item_images.clear();
        self.phase = RequestPhase::Idle;
        self.validation_error = None;
        self.issued_sequence += 1;
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            base_image: self
                .base_image
                .as_ref()
                .map(|image| image.file_name().to_string()),
            item_ids: self
                .item_images
                .iter()
                .map(|image| image.id().to_string())
                .collect(),
            intensity: self.intensity,
            phase: self.phase().label(),
            result_file: self.result().map(|image| image.download_file_name()),
            validation_error: self.validation_error().map(|err| err.to_string()),
            can_generate: self.can_generate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stylist::intake::test_image;

    fn ready_session() -> StyleSession {
        let mut session = StyleSession::default();
        session.set_base_image(test_image("me", "image/jpeg", b"base"));
        session.add_item_image(test_image("hat", "image/png", b"hat"));
        session
    }

    fn image(data: &str) -> GeneratedImage {
        GeneratedImage {
            mime_type: "image/png".to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn generate_requires_base_image() {
        let mut session = StyleSession::default();
        session.add_item_image(test_image("hat", "image/png", b"hat"));

        assert!(!session.can_generate());
        assert_eq!(
            session.begin_generation().unwrap_err(),
            GenerateRejection::Invalid(ValidationError::MissingBaseImage)
        );
        assert_eq!(session.phase(), &RequestPhase::Idle);
        assert_eq!(
            session.validation_error(),
            Some(ValidationError::MissingBaseImage)
        );
    }

    #[test]
    fn generate_requires_items() {
        let mut session = StyleSession::default();
        session.set_base_image(test_image("me", "image/jpeg", b"base"));

        assert!(!session.can_generate());
        assert_eq!(
            session.begin_generation().unwrap_err(),
            GenerateRejection::Invalid(ValidationError::MissingItemImages)
        );
        assert_eq!(session.phase(), &RequestPhase::Idle);
    }

    #[test]
    fn validation_failure_keeps_previous_result() {
        let mut session = ready_session();
        let ticket = session.begin_generation().expect("ready");
        session.complete_generation(ticket.sequence, Ok(image("DONE")));
        session.clear_base_image();

        assert!(session.begin_generation().is_err());
        assert_eq!(session.result(), Some(&image("DONE")));
    }

    #[test]
    fn generate_is_ignored_while_loading() {
        let mut session = ready_session();
        assert!(session.can_generate());
        let first = session.begin_generation().expect("first request");

        assert!(!session.can_generate());
        assert_eq!(
            session.begin_generation().unwrap_err(),
            GenerateRejection::InFlight
        );
        assert_eq!(
            session.complete_generation(first.sequence, Ok(image("A"))),
            Completion::Applied
        );
        assert!(session.can_generate());
    }

    #[test]
    fn ticket_orders_base_then_items() {
        let mut session = ready_session();
        session.add_item_image(test_image("scarf", "image/webp", b"scarf"));
        session.add_item_image(test_image("belt", "image/png", b"belt"));
        session.remove_item_image("scarf");
        session.add_item_image(test_image("bag", "image/png", b"bag"));

        let ticket = session.begin_generation().expect("ready");
        assert_eq!(ticket.request.base.file_name, "me.bin");
        let item_names = ticket
            .request
            .items
            .iter()
            .map(|item| item.file_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(item_names, vec!["hat.bin", "belt.bin", "bag.bin"]);
        assert_eq!(ticket.request.prompt, build_prompt(session.intensity()));
    }

    #[test]
    fn success_and_failure_transitions() {
        let mut session = ready_session();
        let ticket = session.begin_generation().expect("ready");
        assert_eq!(session.phase(), &RequestPhase::Loading);

        session.complete_generation(ticket.sequence, Err(GenerationError::NoImage));
        assert_eq!(
            session.phase(),
            &RequestPhase::Failed(GenerationError::NoImage.to_string())
        );

        let retry = session.begin_generation().expect("retry allowed");
        assert_eq!(session.phase(), &RequestPhase::Loading);
        session.complete_generation(retry.sequence, Ok(image("OK")));
        assert_eq!(session.result(), Some(&image("OK")));
    }

    #[test]
    fn stale_completion_after_reset_is_discarded() {
        let mut session = ready_session();
        let ticket = session.begin_generation().expect("ready");
        session.reset();

        assert_eq!(
            session.complete_generation(ticket.sequence, Ok(image("LATE"))),
            Completion::Stale
        );
        assert_eq!(session.phase(), &RequestPhase::Idle);
        assert!(session.base_image().is_none());
        assert!(session.item_images().is_empty());
    }

    #[test]
    fn completion_with_old_sequence_is_discarded() {
        let mut session = ready_session();
        let first = session.begin_generation().expect("ready");
        session.complete_generation(first.sequence, Err(GenerationError::Transport));
        let _second = session.begin_generation().expect("retry");

        assert_eq!(
            session.complete_generation(first.sequence, Ok(image("OLD"))),
            Completion::Stale
        );
        assert!(session.is_loading());
    }

    #[test]
    fn remove_item_targets_exactly_one_entry() {
        let mut session = ready_session();
        session.add_item_image(test_image("scarf", "image/png", b"scarf"));
        session.add_item_image(test_image("belt", "image/png", b"belt"));

        assert!(session.remove_item_image("scarf"));
        let ids = session.summary().item_ids;
        assert_eq!(ids, vec!["hat".to_string(), "belt".to_string()]);

        assert!(!session.remove_item_image("missing"));
        assert_eq!(session.item_images().len(), 2);
    }

    #[test]
    fn colliding_item_ids_are_disambiguated() {
        let mut session = StyleSession::default();
        let first = session.add_item_image(test_image("hat", "image/png", b"a"));
        let second = session.add_item_image(test_image("hat", "image/png", b"a"));
        let third = session.add_item_image(test_image("hat", "image/png", b"a"));

        assert_eq!(first, "hat");
        assert_eq!(second, "hat-2");
        assert_eq!(third, "hat-3");
        assert!(session.remove_item_image("hat-2"));
        assert_eq!(session.item_images().len(), 2);
    }

    #[test]
    fn base_slot_holds_one_image() {
        let mut session = StyleSession::default();
        assert!(session
            .set_base_image(test_image("one", "image/png", b"1"))
            .is_none());
        let replaced = session.set_base_image(test_image("two", "image/png", b"2"));

        assert_eq!(replaced.map(|image| image.id().to_string()), Some("one".to_string()));
        assert_eq!(session.base_image().map(|image| image.id()), Some("two"));
    }

    #[test]
    fn summary_reports_state() {
        let mut session = ready_session();
        session.set_intensity(Intensity::new(80));
        let summary = session.summary();

        assert_eq!(summary.base_image.as_deref(), Some("me.bin"));
        assert_eq!(summary.item_ids, vec!["hat".to_string()]);
        assert_eq!(summary.intensity.value(), 80);
        assert_eq!(summary.phase, "idle");
        assert!(summary.can_generate);
    }
}
