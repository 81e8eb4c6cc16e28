use thiserror::Error;

use crate::types::ShippingAddress;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_LINE_QUANTITY: i64 = 99;

/// Input rejected by one of the validators below.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Trims and lower-cases an email address, rejecting obviously malformed values.
pub fn normalize_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim().to_ascii_lowercase();
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError::new("email", "must contain '@'"));
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(ValidationError::new("email", "is not a valid address"));
    }
    if email.len() > 254 || email.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("email", "is not a valid address"));
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::new(
            "password",
            format!("must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    Ok(())
}

/// Returns the trimmed value or an error when it is empty or too long.
pub fn require_text(
    field: &'static str,
    value: &str,
    max_len: usize,
) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if trimmed.chars().count() > max_len {
        return Err(ValidationError::new(
            field,
            format!("must be at most {max_len} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

/// Slugs are lower-case ASCII alphanumerics separated by single dashes.
pub fn validate_slug(field: &'static str, slug: &str) -> Result<(), ValidationError> {
    if !(2..=63).contains(&slug.len()) {
        return Err(ValidationError::new(field, "must be 2-63 characters"));
    }
    if !slug
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(ValidationError::new(
            field,
            "may only contain lower-case letters, digits and dashes",
        ));
    }
    if slug.starts_with('-') || slug.ends_with('-') || slug.contains("--") {
        return Err(ValidationError::new(
            field,
            "must not start or end with a dash or contain consecutive dashes",
        ));
    }
    Ok(())
}

/// Upper-cases and validates an ISO-4217 style currency code.
pub fn normalize_currency(raw: &str) -> Result<String, ValidationError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ValidationError::new(
            "currency",
            "must be a three letter currency code",
        ));
    }
    Ok(code)
}

/// Lower-cases a hostname, strips a trailing dot and validates label syntax.
pub fn normalize_hostname(raw: &str) -> Result<String, ValidationError> {
    let host = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.len() > 253 {
        return Err(ValidationError::new("hostname", "must be 1-253 characters"));
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return Err(ValidationError::new(
            "hostname",
            "must contain at least two labels",
        ));
    }

    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return Err(ValidationError::new(
                "hostname",
                "labels must be 1-63 characters",
            ));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(ValidationError::new(
                "hostname",
                "labels may only contain letters, digits and dashes",
            ));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ValidationError::new(
                "hostname",
                "labels must not start or end with a dash",
            ));
        }
    }

    if labels
        .last()
        .is_some_and(|tld| tld.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(ValidationError::new(
            "hostname",
            "IP addresses are not accepted",
        ));
    }

    Ok(host)
}

pub fn validate_quantity(quantity: i64) -> Result<(), ValidationError> {
    if !(1..=MAX_LINE_QUANTITY).contains(&quantity) {
        return Err(ValidationError::new(
            "quantity",
            format!("must be between 1 and {MAX_LINE_QUANTITY}"),
        ));
    }
    Ok(())
}

pub fn validate_price(field: &'static str, cents: i64) -> Result<(), ValidationError> {
    if cents < 0 {
        return Err(ValidationError::new(field, "must not be negative"));
    }
    Ok(())
}

/// Trims every field of an address and checks that required ones are present.
pub fn normalize_address(address: &ShippingAddress) -> Result<ShippingAddress, ValidationError> {
    let country = address.country.trim().to_ascii_uppercase();
    if country.len() != 2 || !country.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ValidationError::new(
            "shipping_address.country",
            "must be a two letter country code",
        ));
    }

    let optional = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    Ok(ShippingAddress {
        name: require_text("shipping_address.name", &address.name, 200)?,
        line1: require_text("shipping_address.line1", &address.line1, 200)?,
        line2: optional(&address.line2),
        city: require_text("shipping_address.city", &address.city, 100)?,
        region: optional(&address.region),
        postal_code: require_text("shipping_address.postal_code", &address.postal_code, 20)?,
        country,
    })
}
