use std::fmt;

pub const MAX_INTENSITY: u8 = 100;

const STRICT_PRESERVATION_CLAUSE: &str = "You MUST NOT change the person's face, hair, body shape, skin tone, or expression in any way. The original person must be perfectly recognizable and unchanged. Adhere strictly to photorealism. The final output MUST look like a real, unedited photograph.";

const BALANCED_REALISM_CLAUSE: &str = "Prioritize realism. Keep the person's core facial features, body shape, and skin tone. Minor, natural adjustments to hair or posture to accommodate the items are acceptable if they enhance realism (e.g., hair being slightly compressed by a hat). The result should be highly photorealistic.";

const CREATIVE_CLAUSE: &str = "A more creative interpretation is allowed. You can make stylistic adjustments to the hair, background, or lighting to better match the new items, but the person's core identity and facial features MUST be preserved. The result should be artistic yet believable.";

/// Style intensity on a 0..=100 scale. Lower values ask for stricter
/// photorealism, higher values grant the model more creative latitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Intensity(u8);

impl Intensity {
    pub fn new(value: u8) -> Self {
        Intensity(value.min(MAX_INTENSITY))
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn realism_level(self) -> RealismLevel {
        RealismLevel::from_intensity(self)
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealismLevel {
    StrictPreservation,
    BalancedRealism,
    Creative,
}

impl RealismLevel {
    pub fn from_intensity(intensity: Intensity) -> Self {
        match intensity.value() {
            0..=30 => RealismLevel::StrictPreservation,
            31..=70 => RealismLevel::BalancedRealism,
            _ => RealismLevel::Creative,
        }
    }

    pub fn clause(self) -> &'static str {
        match self {
            RealismLevel::StrictPreservation => STRICT_PRESERVATION_CLAUSE,
            RealismLevel::BalancedRealism => BALANCED_REALISM_CLAUSE,
            RealismLevel::Creative => CREATIVE_CLAUSE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RealismLevel::StrictPreservation => "strict preservation",
            RealismLevel::BalancedRealism => "balanced realism",
            RealismLevel::Creative => "creative",
        }
    }
}

pub fn build_prompt(intensity: Intensity) -> String {
    let realism_clause = intensity.realism_level().clause();
    format!(
        "**Critically important instruction: Your task is to realistically apply the provided accessory/clothing items onto the person in the base photo. {realism_clause}**\n\
         \n\
         The first image is the base photo of the person. Every image after it shows an item to apply to that person.\n\
         \n\
         The overall goal is to produce a single, seamless, high-quality image where the added items look like they were part of the original photo.\n\
         \n\
         - **Analyze and Preserve:** Identify the person's unique features from the base image. These are non-negotiable and must be preserved.\n\
         - **Composite Items:** Place each item from the subsequent images onto the person naturally and accurately.\n\
         - **Integration:** Masterfully blend lighting, shadows, and textures of the items to match the base photo's environment.\n\
         \n\
         The final output must be only the generated image. Do not include any text or commentary."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt_for(value: u8) -> String {
        build_prompt(Intensity::new(value))
    }

    fn clauses_in(prompt: &str) -> Vec<&'static str> {
        [
            STRICT_PRESERVATION_CLAUSE,
            BALANCED_REALISM_CLAUSE,
            CREATIVE_CLAUSE,
        ]
        .into_iter()
        .filter(|clause| prompt.contains(clause))
        .collect()
    }

    #[test]
    fn low_intensity_uses_strict_preservation() {
        for value in [0, 15, 30] {
            assert_eq!(clauses_in(&prompt_for(value)), vec![STRICT_PRESERVATION_CLAUSE]);
        }
    }

    #[test]
    fn middle_intensity_uses_balanced_realism() {
        for value in [31, 50, 70] {
            assert_eq!(clauses_in(&prompt_for(value)), vec![BALANCED_REALISM_CLAUSE]);
        }
    }

    #[test]
    fn high_intensity_uses_creative_clause() {
        for value in [71, 90, 100] {
            assert_eq!(clauses_in(&prompt_for(value)), vec![CREATIVE_CLAUSE]);
        }
    }

    #[test]
    fn bucket_boundaries_are_inclusive_on_the_lower_bucket() {
        assert_eq!(
            Intensity::new(30).realism_level(),
            RealismLevel::StrictPreservation
        );
        assert_eq!(
            Intensity::new(31).realism_level(),
            RealismLevel::BalancedRealism
        );
        assert_eq!(
            Intensity::new(70).realism_level(),
            RealismLevel::BalancedRealism
        );
        assert_eq!(Intensity::new(71).realism_level(), RealismLevel::Creative);
    }

    #[test]
    fn prompt_is_deterministic() {
        for value in 0..=100 {
            assert_eq!(prompt_for(value), prompt_for(value));
        }
    }

    #[test]
    fn prompt_carries_fixed_instructions() {
        let prompt = prompt_for(50);
        assert!(prompt.contains("The first image is the base photo"));
        assert!(prompt.contains("non-negotiable"));
        assert!(prompt.contains("blend lighting, shadows, and textures"));
        assert!(prompt.ends_with("Do not include any text or commentary."));
    }

    #[test]
    fn intensity_is_clamped_to_scale() {
        assert_eq!(Intensity::new(255).value(), MAX_INTENSITY);
        assert_eq!(Intensity::new(255).realism_level(), RealismLevel::Creative);
    }
}
