//! Apple configuration profile (`.mobileconfig`) renderer.

use super::{ContentBlob, ContentError, CustomProfileConfig, ProfileContentGenerator};
use crate::types::ProfileType;
use minijinja::{AutoEscape, Environment, context};
use serde::Serialize;
use uuid::Uuid;

const TEMPLATE_NAME: &str = "profile.mobileconfig";

// Namespace for deterministic payload UUIDs
const PAYLOAD_NAMESPACE: Uuid = Uuid::from_u128(0x6e6f_6f6b_2d70_726f_6669_6c65_2d70_6179);

const PHONE: &str = "com.apple.mobilephone";
const MESSAGES: &str = "com.apple.MobileSMS";
const PHOTOS: &str = "com.apple.mobileslideshow";
const MAIL: &str = "com.apple.mobilemail";
const SAFARI: &str = "com.apple.mobilesafari";
const CALENDAR: &str = "com.apple.mobilecal";
const CAMERA: &str = "com.apple.camera";
const NOTES: &str = "com.apple.mobilenotes";
const MAPS: &str = "com.apple.Maps";
const MUSIC: &str = "com.apple.Music";
const APP_STORE: &str = "com.apple.AppStore";
const YOUTUBE_KIDS: &str = "com.google.ios.youtubekids";

/// Restriction settings shared by all predefined types, in plist key order.
const RESTRICTION_KEYS: [&str; 5] = [
    "allowAppInstallation",
    "allowCamera",
    "allowExplicitContent",
    "allowInAppPurchases",
    "allowSafari",
];

struct Preset {
    allowed_apps: &'static [&'static str],
    // Values for RESTRICTION_KEYS, same order
    switches: [bool; 5],
}

fn preset(profile_type: ProfileType) -> Option<Preset> {
    let preset = match profile_type {
        ProfileType::FirstPhone => Preset {
            allowed_apps: &[PHONE, MESSAGES],
            switches: [false, false, false, false, false],
        },
        ProfileType::Explorer => Preset {
            allowed_apps: &[PHONE, MESSAGES, PHOTOS, CAMERA, MAPS, YOUTUBE_KIDS, CALENDAR, NOTES],
            switches: [false, true, false, false, false],
        },
        ProfileType::Guardian => Preset {
            allowed_apps: &[PHONE, MESSAGES, PHOTOS, MAIL, SAFARI, CALENDAR, CAMERA, NOTES, MAPS, MUSIC, APP_STORE],
            switches: [true, true, false, false, true],
        },
        ProfileType::TimeOut => Preset {
            allowed_apps: &[PHONE],
            switches: [false, false, false, false, false],
        },
        ProfileType::Custom => return None,
    };
    Some(preset)
}

#[derive(Debug, Serialize)]
struct Restriction {
    key: String,
    kind: &'static str,
    value: serde_json::Value,
}

/// Renders every profile type through one plist template.
pub struct MobileconfigGenerator {
    env: Environment<'static>,
}

impl MobileconfigGenerator {
    pub fn new() -> Result<Self, ContentError> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.add_template(TEMPLATE_NAME, include_str!("templates/profile.mobileconfig.j2"))
            .map_err(|e| ContentError::Render(e.to_string()))?;
        Ok(Self { env })
    }
}

/// `"Smith Family"` -> `"smith-family"`
pub fn family_slug(family_name: &str) -> String {
    let slug: String = family_name
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let parts: Vec<&str> = slug.split('-').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() { "family".to_string() } else { parts.join("-") }
}

/// `allow_camera` -> `allowCamera`; keys already in camel case pass through.
fn plist_key(key: &str) -> Result<String, ContentError> {
    let valid = key.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(ContentError::InvalidConfig(format!("restriction key '{key}' is not a valid identifier")));
    }

    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn custom_restrictions(config: &CustomProfileConfig) -> Result<Vec<Restriction>, ContentError> {
    config
        .restrictions
        .iter()
        .map(|(key, value)| {
            let kind = match value {
                serde_json::Value::Bool(_) => "bool",
                serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
                serde_json::Value::String(_) => "string",
                other => {
                    return Err(ContentError::InvalidConfig(format!(
                        "restriction '{key}' must be a boolean, integer or string, got {other}"
                    )));
                }
            };
            Ok(Restriction {
                key: plist_key(key)?,
                kind,
                value: value.clone(),
            })
        })
        .collect()
}

fn check_bundle_ids(apps: &[String]) -> Result<(), ContentError> {
    for app in apps {
        let valid = !app.is_empty() && app.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
        if !valid {
            return Err(ContentError::InvalidConfig(format!("'{app}' is not a valid bundle identifier")));
        }
    }
    Ok(())
}

impl ProfileContentGenerator for MobileconfigGenerator {
    fn render(&self, profile_type: ProfileType, family_name: &str, config: Option<&CustomProfileConfig>) -> Result<ContentBlob, ContentError> {
        let (allowed_apps, restrictions): (Vec<String>, Vec<Restriction>) = match preset(profile_type) {
            Some(preset) => (
                preset.allowed_apps.iter().map(|a| a.to_string()).collect(),
                RESTRICTION_KEYS
                    .iter()
                    .zip(preset.switches)
                    .map(|(key, on)| Restriction {
                        key: key.to_string(),
                        kind: "bool",
                        value: serde_json::Value::Bool(on),
                    })
                    .collect(),
            ),
            None => {
                let config = config.ok_or(ContentError::MissingConfig)?;
                check_bundle_ids(&config.allowed_apps)?;
                (config.allowed_apps.clone(), custom_restrictions(config)?)
            }
        };

        let identifier = format!("com.nook.{}.{}", family_slug(family_name), profile_type.as_str().replace('_', ""));
        let payload_uuid = |suffix: &str| Uuid::new_v5(&PAYLOAD_NAMESPACE, format!("{identifier}.{suffix}").as_bytes()).to_string().to_uppercase();

        let template = self.env.get_template(TEMPLATE_NAME).map_err(|e| ContentError::Render(e.to_string()))?;
        let rendered = template
            .render(context! {
                identifier => &identifier,
                family_name => family_name,
                display_name => profile_type.display_name(),
                description => profile_type.default_description(),
                restrictions => restrictions,
                allowed_apps => allowed_apps,
                restrictions_uuid => payload_uuid("restrictions"),
                apps_uuid => payload_uuid("allowedapps"),
                profile_uuid => payload_uuid("profile"),
            })
            .map_err(|e| ContentError::Render(e.to_string()))?;

        Ok(ContentBlob::new(rendered))
    }
}
