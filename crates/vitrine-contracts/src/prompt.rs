use crate::model::{AccessoryItem, AccessoryKind, GenerationSettings, SubjectPhoto};

const ANALYSIS_BLOCK: &str = "PHOTOREALISTIC ANALYSIS AND INTEGRATION PROCESS (MANDATORY):

STEP 1: SCENE ANALYSIS (SUBJECT PHOTO)
-   Lighting: Identify the direction, intensity, color temperature (warm/cool) and hardness (crisp/diffuse shadows) of the main light source. Note the fill lights and existing reflections.
-   Anatomy: Study the proportions of the area where the item will be placed (neck thickness, finger size, wrist contour).

STEP 2: ITEM ANALYSIS
-   Material: Determine the material properties of the item (polished gold, brushed silver, transparent gem, matte pearl).
-   Intrinsic scale: Estimate the real-world size of the item.

STEP 3: SYNTHESIS AND RENDERING (THE MOST IMPORTANT PART)
-   Adaptive scaling: Resize the item so it looks proportionate and realistic on the subject's anatomy. A ring must fit around a finger, not float over it. A necklace must follow the curve of the neck.
-   Lighting mapping: Light and shade the item 100% consistently with the scene lighting analyzed in STEP 1. Reflections on metal must reflect the photo's environment. Specular highlights must match the light direction.
-   Cast shadows: Generate subtle, precise shadows that the item would cast on the skin or clothing. Their shape and softness must match the light source.
-   Occlusion and interaction: Make sure the item interacts correctly with its surroundings (part of a necklace hidden under the hair, a strap behind a collar).";

const JSON_OUTPUT_SCHEMA: &str = "```json
{
  \"status\": \"ok | needs_input | error\",
  \"summary\": \"Short summary of the edit that was performed.\",
  \"placements\": [ { \"item_index\": 0, \"categoria\": \"string\", \"confidence\": 0.9 } ],
  \"debug\": { \"notes\": \"Brief notes about the editing process.\" }
}
```
If you cannot complete the request, set status='needs_input' and explain why in 'summary'.";

/// Size clause appended to an item line. Empty when the scale rounds to no
/// visible change.
pub fn format_scale(scale: f64) -> String {
    if scale == 1.0 {
        return String::new();
    }
    let percent = ((scale - 1.0).abs() * 100.0).round() as i64;
    if percent == 0 {
        return String::new();
    }
    let direction = if scale > 1.0 { "larger" } else { "smaller" };
    format!(" and must be approximately {percent}% {direction} than normal")
}

fn placement_clause(kind: &AccessoryKind) -> String {
    match kind {
        AccessoryKind::Ring { finger: Some(finger) } => {
            format!(" on the '{}' finger", finger.as_str())
        }
        AccessoryKind::Bracelet { wrist: Some(wrist) } => {
            format!(" on the '{}' wrist", wrist.as_str())
        }
        AccessoryKind::Earring { side: Some(side) } => {
            format!(" for the '{}' side", side.as_str())
        }
        AccessoryKind::Hat => " that must be placed naturally on the head".to_string(),
        AccessoryKind::Scarf => " that must be placed around the neck".to_string(),
        AccessoryKind::Handbag { hand: Some(hand) } => {
            format!(" that must be held naturally in the '{}' hand", hand.as_str())
        }
        AccessoryKind::Handbag { hand: None } => {
            " that must be held in one hand naturally".to_string()
        }
        _ => String::new(),
    }
}

pub fn describe_item(index: usize, item: &AccessoryItem) -> String {
    format!(
        "- Item {} (Image {}): a '{}'{}{}",
        index + 1,
        index + 2,
        item.kind.category(),
        placement_clause(&item.kind),
        format_scale(item.scale)
    )
}

fn base_rules(subject: &SubjectPhoto) -> String {
    format!(
        "ABSOLUTE MANDATE: YOU ARE A PRECISE EDITING TOOL, NOT AN IMAGE CREATOR. YOUR ONLY FUNCTION IS TO OVERLAY ITEMS ONTO AN EXISTING IMAGE WITHOUT ALTERING IT.

CRITICAL, INVIOLABLE RULES (BREAKING ANY OF THEM IS A TOTAL FAILURE):

1.  **SACROSANCT HUMAN IDENTITY**:
    -   NEVER, UNDER ANY CIRCUMSTANCE, ALTER THE PERSON'S FACE. Face, eyes, nose, mouth, facial expression and skin must remain 100% identical to the original photo.
    -   BONE STRUCTURE, body shape and pose MUST NOT CHANGE IN THE SLIGHTEST.
    -   PRESERVE THE HAIR: Do not change its style, color, texture or position.

2.  **IMMUTABLE BACKGROUND AND ENVIRONMENT**:
    -   THE BACKGROUND MUST REMAIN IDENTICAL. Do not remove, add or modify any object, texture or lighting element of the environment.

3.  **TECHNICAL PRECISION**:
    -   EXACT DIMENSIONS: The final image MUST have exactly the same dimensions as the original: {width}px wide by {height}px high. DO NOT crop or resize it.
    -   MINIMAL CHANGES: The only permitted change is the addition of the items. Think of it as pasting a photorealistic layer over the original image. No other changes are authorized.

ANY DEVIATION FROM THESE RULES, HOWEVER SMALL, IS A FAILURE. THE ORIGINAL IMAGE IS THE ABSOLUTE TRUTH.",
        width = subject.width(),
        height = subject.height(),
    )
}

pub fn compose_initial_prompt(
    subject: &SubjectPhoto,
    items: &[AccessoryItem],
    settings: &GenerationSettings,
) -> String {
    let item_lines = items
        .iter()
        .enumerate()
        .map(|(index, item)| describe_item(index, item))
        .collect::<Vec<String>>()
        .join("\n");

    format!(
        "{rules}

GOAL: On top of the subject's base image, integrate the following items with the highest possible photorealism, following the critical rules and the analysis process to the letter.

ITEMS TO INTEGRATE:
{item_lines}

{ANALYSIS_BLOCK}

ADDITIONAL CONFIGURATION:
- Remove existing jewelry: {remove_existing}
- General lighting effect to apply: {lighting} (Use this as a guide, but prioritize the analysis of the original lighting.)

REQUIRED OUTPUT FORMAT:
Your response MUST contain exactly two parts:
1. The final edited image in high resolution.
2. A text block with a valid JSON object that follows this exact schema:
{JSON_OUTPUT_SCHEMA}
",
        rules = base_rules(subject),
        remove_existing = settings.remove_existing_jewelry.as_str(),
        lighting = settings.lighting_effect.as_str(),
    )
}

pub fn compose_refine_prompt(subject: &SubjectPhoto, instruction: &str) -> String {
    format!(
        "RE-EDIT TASK: Modify \"Image 2 (the already edited version)\" according to the instruction, while following the same critical rules as the initial creation.

{rules}

ADDITIONAL REFINEMENT RULE: When applying the new instruction, KEEP the level of photorealism already established. Make sure the scale, lighting, reflections and shadows of the modified item remain 100% consistent with the subject's original photo.

CONTEXT IMAGES:
- Image 1: The ORIGINAL photo of the subject. The identity and lighting of this scene are the ABSOLUTE TRUTH.
- Image 2: The image you must MODIFY.

RE-EDIT INSTRUCTION: \"{instruction}\"

OUTPUT FORMAT: Return exactly two parts, the new edited image and a text block with a JSON object following the same schema as the previous request:
{JSON_OUTPUT_SCHEMA}
",
        rules = base_rules(subject),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Finger, ImageDescriptor, LightingEffect, RemoveExisting, Side};

    fn subject(width: u32, height: u32) -> SubjectPhoto {
        SubjectPhoto::new(
            ImageDescriptor::new("model.jpg", "AAAA", "image/jpeg"),
            width,
            height,
        )
    }

    fn item(kind: AccessoryKind, scale: f64) -> AccessoryItem {
        AccessoryItem::new(1, kind)
            .with_image(ImageDescriptor::new("item.png", "BBBB", "image/png"))
            .with_scale(scale)
    }

    fn extract_number_before(text: &str, marker: &str) -> Option<u32> {
        let end = text.find(marker)?;
        let digits = text[..end]
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect::<String>();
        digits.chars().rev().collect::<String>().parse().ok()
    }

    #[test]
    fn scale_clause_matches_rounded_percentage_over_range() {
        for step in 0..=100 {
            let scale = 0.5 + step as f64 * 0.01;
            let clause = format_scale(scale);
            let percent = ((scale - 1.0).abs() * 100.0).round() as i64;
            if percent == 0 {
                assert!(clause.is_empty(), "scale {scale} produced '{clause}'");
                continue;
            }
            assert!(clause.contains(&format!("approximately {percent}% ")));
            assert_eq!(clause.contains("larger"), scale > 1.0, "scale {scale}");
            assert_eq!(clause.contains("smaller"), scale < 1.0, "scale {scale}");
        }
    }

    #[test]
    fn scale_of_one_never_adds_clause() {
        assert_eq!(format_scale(1.0), "");
        assert_eq!(format_scale(1.004), "");
        assert_eq!(
            format_scale(1.25),
            " and must be approximately 25% larger than normal"
        );
        assert_eq!(
            format_scale(0.7),
            " and must be approximately 30% smaller than normal"
        );
    }

    #[test]
    fn item_lines_follow_category_templates() {
        let ring = item(
            AccessoryKind::Ring {
                finger: Some(Finger::Ring),
            },
            1.0,
        );
        assert_eq!(
            describe_item(0, &ring),
            "- Item 1 (Image 2): a 'ring' on the 'ring' finger"
        );

        let bracelet = item(AccessoryKind::Bracelet { wrist: None }, 1.0);
        assert_eq!(describe_item(1, &bracelet), "- Item 2 (Image 3): a 'bracelet'");

        let earring = item(
            AccessoryKind::Earring {
                side: Some(Side::Left),
            },
            1.0,
        );
        assert!(describe_item(0, &earring).ends_with(" for the 'left' side"));

        assert!(describe_item(0, &item(AccessoryKind::Hat, 1.0))
            .ends_with("that must be placed naturally on the head"));
        assert!(describe_item(0, &item(AccessoryKind::Scarf, 1.0))
            .ends_with("that must be placed around the neck"));
        assert!(describe_item(0, &item(AccessoryKind::Handbag { hand: None }, 1.0))
            .ends_with("that must be held in one hand naturally"));
        assert!(describe_item(
            0,
            &item(
                AccessoryKind::Handbag {
                    hand: Some(Side::Right)
                },
                1.0
            )
        )
        .ends_with("held naturally in the 'right' hand"));

        let scaled = item(AccessoryKind::Necklace, 1.2);
        assert_eq!(
            describe_item(2, &scaled),
            "- Item 3 (Image 4): a 'necklace' and must be approximately 20% larger than normal"
        );
    }

    #[test]
    fn unknown_category_gets_bare_description() {
        for category in ["brooch", "Hat", "", "bolso de mano"] {
            let line = describe_item(0, &item(AccessoryKind::from_category(category), 1.0));
            assert_eq!(line, format!("- Item 1 (Image 2): a '{category}'"));
        }
    }

    #[test]
    fn initial_prompt_sections_appear_in_order() {
        let settings = GenerationSettings {
            remove_existing_jewelry: RemoveExisting::Yes,
            lighting_effect: LightingEffect::Warm,
        };
        let prompt = compose_initial_prompt(
            &subject(640, 960),
            &[item(AccessoryKind::Necklace, 1.0), item(AccessoryKind::Hat, 0.8)],
            &settings,
        );

        let markers = [
            "ABSOLUTE MANDATE",
            "ITEMS TO INTEGRATE:",
            "- Item 1 (Image 2): a 'necklace'",
            "- Item 2 (Image 3): a 'hat'",
            "STEP 1: SCENE ANALYSIS",
            "Occlusion and interaction",
            "ADDITIONAL CONFIGURATION:",
            "REQUIRED OUTPUT FORMAT:",
            "```json",
            "status='needs_input'",
        ];
        let mut cursor = 0;
        for marker in markers {
            let found = prompt[cursor..]
                .find(marker)
                .unwrap_or_else(|| panic!("missing or out of order: {marker}"));
            cursor += found + marker.len();
        }
        assert!(prompt.contains("- Remove existing jewelry: yes"));
        assert!(prompt.contains("- General lighting effect to apply: warm"));
        assert!(prompt.contains("\"categoria\""));
    }

    #[test]
    fn prompt_dimensions_round_trip() {
        for (width, height) in [(1, 1), (640, 960), (4032, 3024)] {
            let prompt = compose_initial_prompt(
                &subject(width, height),
                &[item(AccessoryKind::Necklace, 1.0)],
                &GenerationSettings::default(),
            );
            assert_eq!(extract_number_before(&prompt, "px wide"), Some(width));
            assert_eq!(extract_number_before(&prompt, "px high"), Some(height));

            let refine = compose_refine_prompt(&subject(width, height), "smaller");
            assert_eq!(extract_number_before(&refine, "px wide"), Some(width));
            assert_eq!(extract_number_before(&refine, "px high"), Some(height));
        }
    }

    #[test]
    fn refine_prompt_embeds_instruction_and_context_images() {
        let prompt = compose_refine_prompt(&subject(300, 400), "make the ring gold");
        assert!(prompt.starts_with("RE-EDIT TASK"));
        assert!(prompt.contains("RE-EDIT INSTRUCTION: \"make the ring gold\""));
        assert!(prompt.contains("- Image 1: The ORIGINAL photo"));
        assert!(prompt.contains("- Image 2: The image you must MODIFY."));
        assert!(prompt.contains("CRITICAL, INVIOLABLE RULES"));
        assert!(prompt.contains("```json"));
    }
}
