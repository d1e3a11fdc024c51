//! History normalization: unified messages in, native message array (plus
//! an optional out-of-band system string) out. System text from anywhere in
//! the history is concatenated and placed according to the profile's
//! [`SystemMessageMode`]; tool turns missing a correlation id are dropped
//! rather than sent uncorrelated; malformed turns degrade to empty text and
//! never abort the conversation.

use serde_json::Value;

use crate::profile::{ProtocolFamily, ProviderProfile, SystemMessageMode};
use crate::protocol;
use crate::types::{ChatMessage, ImageSource, MessageContent, MessagePart, Role};

/// The family-native message array plus the system text when the profile
/// wants it out-of-band.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRequest {
    pub messages: Vec<Value>,
    pub system_parameter: Option<String>,
}

/// Normalize `history` for `profile`. `system_prompt` is appended after any
/// system turns already present in the history, blank-line joined.
pub fn normalize(
    profile: &ProviderProfile,
    history: &[ChatMessage],
    system_prompt: Option<&str>,
) -> NormalizedRequest {
    let mut system_texts: Vec<String> = history
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.text_only())
        .filter(|text| !text.is_empty())
        .collect();
    if let Some(prompt) = system_prompt
        && !prompt.is_empty()
    {
        system_texts.push(prompt.to_string());
    }
    let system_text = (!system_texts.is_empty()).then(|| system_texts.join("\n\n"));

    let mut turns: Vec<ChatMessage> = history
        .iter()
        .filter(|message| message.role != Role::System)
        .cloned()
        .collect();

    let mut system_parameter = None;
    if let Some(text) = system_text {
        match effective_system_mode(profile) {
            SystemMessageMode::Parameter => system_parameter = Some(text),
            SystemMessageMode::FirstUser => prefix_first_user(&mut turns, &text),
            SystemMessageMode::Message => turns.insert(0, ChatMessage::system(text)),
        }
    }

    let messages = turns
        .iter()
        .flat_map(|message| protocol::encode_message(profile, message))
        .collect();

    NormalizedRequest {
        messages,
        system_parameter,
    }
}

/// Anthropic and Gemini wire formats have no in-band system role; a profile
/// asking for one on those families degrades to the parameter channel.
fn effective_system_mode(profile: &ProviderProfile) -> SystemMessageMode {
    match (profile.family, profile.system_mode) {
        (
            ProtocolFamily::Anthropic | ProtocolFamily::Gemini,
            SystemMessageMode::Message,
        ) => {
            tracing::debug!(
                provider = %profile.name,
                "system mode 'message' unsupported by family, using parameter"
            );
            SystemMessageMode::Parameter
        }
        (_, mode) => mode,
    }
}

fn prefix_first_user(turns: &mut Vec<ChatMessage>, system_text: &str) {
    let Some(first_user) = turns
        .iter_mut()
        .find(|message| message.role == Role::User)
    else {
        // System-only prompt with no user turn yet: the system text becomes
        // the user turn.
        turns.insert(0, ChatMessage::user(system_text));
        return;
    };

    match &mut first_user.content {
        MessageContent::Text(text) => {
            *text = if text.is_empty() {
                system_text.to_string()
            } else {
                format!("{system_text}\n\n{text}")
            };
        }
        MessageContent::Parts(parts) => {
            parts.insert(
                0,
                MessagePart::Text {
                    text: format!("{system_text}\n\n"),
                },
            );
        }
    }
}

/// Render an image source for an OpenAI-shaped `image_url` field. Profiles
/// may override the default with a template substituting `{{url}}`,
/// `{{base64}}`, and `{{mediaType}}`.
pub fn render_image_url(source: &ImageSource, template: Option<&str>) -> String {
    match template {
        Some(template) => {
            let (url, base64) = match source {
                ImageSource::Url { url } => (url.as_str(), ""),
                ImageSource::Base64 { data, .. } => ("", data.as_str()),
            };
            template
                .replace("{{url}}", url)
                .replace("{{base64}}", base64)
                .replace("{{mediaType}}", source.media_type())
        }
        None => match source {
            ImageSource::Url { url } => url.clone(),
            ImageSource::Base64 { data, .. } => {
                format!("data:{};base64,{}", source.media_type(), data)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize, render_image_url};
    use crate::profile::{ProviderProfile, SystemMessageMode};
    use crate::types::{ChatMessage, ImageSource};

    #[test]
    fn system_turns_concatenate_with_injected_prompt() {
        let mut profile = ProviderProfile::openai();
        profile.system_mode = SystemMessageMode::Parameter;
        let history = vec![ChatMessage::system("be brief"), ChatMessage::user("hi")];
        let normalized = normalize(&profile, &history, Some("answer in French"));
        assert_eq!(
            normalized.system_parameter.as_deref(),
            Some("be brief\n\nanswer in French")
        );
        assert_eq!(normalized.messages.len(), 1);
    }

    #[test]
    fn first_user_mode_prefixes_system_text() {
        let mut profile = ProviderProfile::openai();
        profile.system_mode = SystemMessageMode::FirstUser;
        let history = vec![ChatMessage::user("hi")];
        let normalized = normalize(&profile, &history, Some("S"));
        assert!(normalized.system_parameter.is_none());
        assert_eq!(normalized.messages[0]["content"], "S\n\nhi");
    }

    #[test]
    fn first_user_mode_on_custom_profile_yields_single_user_message() {
        let format: crate::profile::CustomFormat =
            serde_json::from_value(serde_json::json!({"text_path": "delta.text"})).unwrap();
        let mut profile =
            ProviderProfile::custom("local", "http://localhost:8080", "/chat", format);
        profile.system_mode = SystemMessageMode::FirstUser;
        let history = vec![ChatMessage::system("S"), ChatMessage::user("hi")];
        let normalized = normalize(&profile, &history, None);
        assert_eq!(normalized.messages.len(), 1);
        assert_eq!(normalized.messages[0]["role"], "user");
        assert_eq!(normalized.messages[0]["content"], "S\n\nhi");
    }

    #[test]
    fn first_user_mode_without_user_turn_synthesizes_one() {
        let mut profile = ProviderProfile::openai();
        profile.system_mode = SystemMessageMode::FirstUser;
        let normalized = normalize(&profile, &[], Some("S"));
        assert_eq!(normalized.messages[0]["role"], "user");
        assert_eq!(normalized.messages[0]["content"], "S");
    }

    #[test]
    fn message_mode_emits_leading_system_entry() {
        let profile = ProviderProfile::openai();
        let history = vec![ChatMessage::user("hi")];
        let normalized = normalize(&profile, &history, Some("S"));
        assert_eq!(normalized.messages[0]["role"], "system");
        assert_eq!(normalized.messages[1]["role"], "user");
    }

    #[test]
    fn message_mode_on_anthropic_degrades_to_parameter() {
        let mut profile = ProviderProfile::anthropic();
        profile.system_mode = SystemMessageMode::Message;
        let normalized = normalize(&profile, &[ChatMessage::user("hi")], Some("S"));
        assert_eq!(normalized.system_parameter.as_deref(), Some("S"));
    }

    #[test]
    fn default_image_rendering() {
        assert_eq!(
            render_image_url(&ImageSource::url("https://x/y.png"), None),
            "https://x/y.png"
        );
        assert_eq!(
            render_image_url(&ImageSource::base64("AAAA", Some("image/jpeg")), None),
            "data:image/jpeg;base64,AAAA"
        );
    }

    #[test]
    fn template_substitution() {
        let rendered = render_image_url(
            &ImageSource::base64("QUJD", None),
            Some("data:{{mediaType}};base64,{{base64}}"),
        );
        assert_eq!(rendered, "data:image/png;base64,QUJD");
    }
}
