use crate::error::{MailError, Result};

/// Basic email validation
pub fn validate_email(email: &str) -> Result<()> {
    if email.is_empty() {
        return Err(MailError::InvalidEmail("Email is empty".to_string()));
    }

    if !email.contains('@') {
        return Err(MailError::InvalidEmail(
            "Email must contain @".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 {
        return Err(MailError::InvalidEmail("Invalid email format".to_string()));
    }

    let local = parts[0];
    let domain = parts[1];

    if local.is_empty() || domain.is_empty() {
        return Err(MailError::InvalidEmail(
            "Email parts cannot be empty".to_string(),
        ));
    }

    if !domain.contains('.') && !domain.eq_ignore_ascii_case("localhost") {
        return Err(MailError::InvalidEmail(
            "Domain must contain a dot".to_string(),
        ));
    }

    if email.chars().any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>') {
        return Err(MailError::InvalidEmail(
            "Email contains forbidden characters".to_string(),
        ));
    }

    Ok(())
}

/// Lower-cased address used as a stable identity / counter key
pub fn normalize_address(email: &str) -> String {
    email.trim().trim_start_matches('<').trim_end_matches('>').to_lowercase()
}

/// Domain part of an address, lower-cased
pub fn domain_of(email: &str) -> Option<String> {
    let email = email.trim().trim_start_matches('<').trim_end_matches('>');
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .filter(|d| !d.is_empty())
}

/// Local part of an address (everything before the last `@`)
pub fn local_part(email: &str) -> &str {
    match email.rsplit_once('@') {
        Some((local, _)) => local,
        None => email,
    }
}
