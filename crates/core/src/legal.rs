//! Legal policy boilerplate and `{{ variable }}` substitution.

use std::collections::BTreeMap;

use crate::types::LegalDocumentKind;

/// Built-in template for a policy document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boilerplate {
    pub title: &'static str,
    pub body_html: &'static str,
}

pub fn boilerplate(kind: LegalDocumentKind) -> Boilerplate {
    match kind {
        LegalDocumentKind::Refund => Boilerplate {
            title: "Refund Policy",
            body_html: "<h1>Refund Policy</h1>\n\
<p>We want you to be happy with every purchase from {{ store_name }}. If you are not satisfied, \
you may request a refund within {{ refund_window_days }} days of delivery.</p>\n\
<p>Items must be unused and in their original packaging. To start a return, contact \
{{ support_email }}.</p>\n\
<p>Refunds are issued to the original payment method once the returned item has been received \
and inspected.</p>",
        },
        LegalDocumentKind::Privacy => Boilerplate {
            title: "Privacy Policy",
            body_html: "<h1>Privacy Policy</h1>\n\
<p>{{ company_name }} operates {{ store_url }}. This policy explains which personal data we \
collect when you visit the store or place an order, and how we use it.</p>\n\
<p>We collect the contact and shipping details you provide at checkout solely to fulfil your \
order and to communicate with you about it. We do not sell your personal data.</p>\n\
<p>For questions or data requests, write to {{ support_email }}.</p>",
        },
        LegalDocumentKind::Shipping => Boilerplate {
            title: "Shipping Policy",
            body_html: "<h1>Shipping Policy</h1>\n\
<p>Orders placed on {{ store_name }} are processed within {{ processing_days }} business days.</p>\n\
<p>Shipping costs are shown at checkout before you pay. Tracking information is sent by email \
once your order has shipped.</p>\n\
<p>If your package has not arrived, contact {{ support_email }}.</p>",
        },
        LegalDocumentKind::Terms => Boilerplate {
            title: "Terms of Service",
            body_html: "<h1>Terms of Service</h1>\n\
<p>These terms govern your use of {{ store_url }}, operated by {{ company_name }}. By placing \
an order you agree to them.</p>\n\
<p>Prices and availability may change without notice. We reserve the right to cancel orders \
affected by pricing errors.</p>\n\
<p>These terms are governed by the laws of {{ governing_law }}.</p>",
        },
        LegalDocumentKind::Contact => Boilerplate {
            title: "Contact Information",
            body_html: "<h1>Contact Information</h1>\n\
<p>{{ company_name }}</p>\n\
<p>{{ company_address }}</p>\n\
<p>Email: {{ support_email }}</p>",
        },
    }
}

/// Variables filled in when a set does not provide its own value.
pub fn default_variables() -> BTreeMap<String, String> {
    [
        ("refund_window_days", "30"),
        ("processing_days", "3"),
        ("governing_law", "the jurisdiction of the store operator"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect()
}

/// Replaces `{{ name }}` placeholders with HTML-escaped values.
///
/// Whitespace inside the braces is ignored. Placeholders without a value,
/// and unterminated `{{`, are emitted verbatim.
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            output.push_str(&rest[start..]);
            return output;
        };

        let name = after_open[..end].trim();
        match variables.get(name) {
            Some(value) if is_variable_name(name) => output.push_str(&escape_html(value)),
            _ => output.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    output.push_str(rest);
    output
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
