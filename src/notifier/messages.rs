//! Notification message templates.
//!
//! Locales are normalized to their two-letter prefix and fall back to
//! English. The body mentions how long ago the vault access was first
//! noticed, or "just now" on the first delivery.

/// Title and body of a notification, localized and with the placeholders
/// substituted.
pub fn compose(
    locale: &str,
    vault_number: u32,
    wallet_name: &str,
    seconds_since_first: Option<i64>,
) -> (String, String) {
    let time_since = time_since(locale, seconds_since_first);

    match normalize(locale) {
        "es" => (
            format!("Bóveda #{} accedida", vault_number),
            format!(
                "Tu bóveda #{} de la cartera \"{}\" fue accedida {}.",
                vault_number, wallet_name, time_since
            ),
        ),
        _ => (
            format!("Vault #{} accessed", vault_number),
            format!(
                "Your vault #{} in wallet \"{}\" was accessed {}.",
                vault_number, wallet_name, time_since
            ),
        ),
    }
}

/// A human duration since the first detection. `None` means this is the
/// first delivery.
pub fn time_since(locale: &str, seconds: Option<i64>) -> String {
    let spanish = normalize(locale) == "es";

    let seconds = match seconds {
        None => {
            return if spanish {
                "ahora mismo".to_string()
            } else {
                "just now".to_string()
            }
        }
        Some(seconds) => seconds.max(0),
    };

    let (count, unit_en, unit_es) = if seconds >= 86_400 {
        (seconds / 86_400, ("day", "days"), ("día", "días"))
    } else if seconds >= 3_600 {
        (seconds / 3_600, ("hour", "hours"), ("hora", "horas"))
    } else {
        (
            std::cmp::max(seconds / 60, 1),
            ("minute", "minutes"),
            ("minuto", "minutos"),
        )
    };

    if spanish {
        let unit = if count == 1 { unit_es.0 } else { unit_es.1 };
        format!("hace {} {}", count, unit)
    } else {
        let unit = if count == 1 { unit_en.0 } else { unit_en.1 };
        format!("{} {} ago", count, unit)
    }
}

// "es-MX" and "es_ES" both mean Spanish to us
fn normalize(locale: &str) -> &str {
    let prefix = locale.get(..2).unwrap_or("en");
    match prefix {
        "es" | "ES" | "Es" => "es",
        _ => "en",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_normalization() {
        assert_eq!(normalize("en"), "en");
        assert_eq!(normalize("en-US"), "en");
        assert_eq!(normalize("es"), "es");
        assert_eq!(normalize("es-MX"), "es");
        assert_eq!(normalize("ES_es"), "es");
        // Unknown locales fall back to English
        assert_eq!(normalize("fr"), "en");
        assert_eq!(normalize(""), "en");
        assert_eq!(normalize("e"), "en");
    }

    #[test]
    fn first_delivery_wording() {
        assert_eq!(time_since("en", None), "just now");
        assert_eq!(time_since("es-419", None), "ahora mismo");
    }

    #[test]
    fn humanized_durations() {
        assert_eq!(time_since("en", Some(30)), "1 minute ago");
        assert_eq!(time_since("en", Some(120)), "2 minutes ago");
        assert_eq!(time_since("en", Some(3_600)), "1 hour ago");
        assert_eq!(time_since("en", Some(7 * 3_600)), "7 hours ago");
        assert_eq!(time_since("en", Some(86_400)), "1 day ago");
        assert_eq!(time_since("en", Some(3 * 86_400)), "3 days ago");
        assert_eq!(time_since("es", Some(60)), "hace 1 minuto");
        assert_eq!(time_since("es", Some(2 * 86_400)), "hace 2 días");
    }

    #[test]
    fn composed_messages() {
        let (title, body) = compose("en-US", 3, "Savings", None);
        assert_eq!(title, "Vault #3 accessed");
        assert_eq!(body, "Your vault #3 in wallet \"Savings\" was accessed just now.");

        let (title, body) = compose("es-MX", 1, "Ahorros", Some(3_600));
        assert_eq!(title, "Bóveda #1 accedida");
        assert_eq!(
            body,
            "Tu bóveda #1 de la cartera \"Ahorros\" fue accedida hace 1 hora."
        );
    }
}
