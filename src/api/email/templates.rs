//! Transactional email templates.
//!
//! Outbox rows carry a template name plus a JSON payload; rendering happens at
//! delivery time so a row can be retried without re-reading any other table.

use anyhow::{Result, anyhow};
use serde_json::{Map, Value};

pub const VERIFY_EMAIL: &str = "verify_email";
pub const CONTACT_ADMIN: &str = "contact_admin";
pub const CONTACT_CONFIRMATION: &str = "contact_confirmation";

const NOT_PROVIDED: &str = "No proporcionado";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub text: String,
    pub html: String,
    pub reply_to: Option<String>,
}

/// Render an outbox row into a message body.
///
/// # Errors
/// Returns an error for unknown templates, payloads that are not JSON objects,
/// or missing required fields.
pub fn render(template: &str, payload_json: &str) -> Result<RenderedEmail> {
    let payload: Value = serde_json::from_str(payload_json)
        .map_err(|err| anyhow!("invalid payload for template {template}: {err}"))?;
    let Value::Object(payload) = payload else {
        return Err(anyhow!("payload for template {template} is not an object"));
    };

    match template {
        VERIFY_EMAIL => verify_email(&payload),
        CONTACT_ADMIN => contact_admin(&payload),
        CONTACT_CONFIRMATION => contact_confirmation(&payload),
        other => Err(anyhow!("unknown email template: {other}")),
    }
}

fn verify_email(payload: &Map<String, Value>) -> Result<RenderedEmail> {
    let verify_url = required(payload, "verify_url")?;
    let nombre = optional(payload, "nombre").unwrap_or("Usuario");
    let ttl_minutes = payload
        .get("ttl_minutes")
        .and_then(Value::as_u64)
        .unwrap_or(30);

    let text = format!(
        "¡Hola {nombre}!\n\n\
         Gracias por registrarte en ZeroWork. Para activar tu cuenta abre este enlace:\n\n\
         {verify_url}\n\n\
         El enlace caduca en {ttl_minutes} minutos y solo puede usarse una vez.\n\
         Si no creaste esta cuenta, ignora este mensaje.\n"
    );

    let html = layout(
        "Verifica tu cuenta",
        &format!(
            "<p>¡Hola <strong>{nombre}</strong>!</p>\
             <p>Gracias por registrarte en ZeroWork. Solo falta un paso para activar tu cuenta.</p>\
             <p style=\"text-align:center;margin:32px 0\">\
             <a href=\"{url}\" style=\"background:#a855f7;color:#ffffff;padding:14px 28px;\
             border-radius:8px;text-decoration:none;font-weight:600\">Verificar email</a></p>\
             <p>Si el botón no funciona, copia este enlace en tu navegador:</p>\
             <p style=\"word-break:break-all\">{url}</p>\
             <p>El enlace caduca en {ttl_minutes} minutos y solo puede usarse una vez.</p>",
            nombre = escape_html(nombre),
            url = escape_html(verify_url),
        ),
    );

    Ok(RenderedEmail {
        subject: "🔐 Verifica tu cuenta - ¡Solo un paso más!".to_string(),
        text,
        html,
        reply_to: None,
    })
}

fn contact_admin(payload: &Map<String, Value>) -> Result<RenderedEmail> {
    let nombre = required(payload, "nombre")?;
    let email = required(payload, "email")?;
    let mensaje = required(payload, "mensaje")?;
    let telefono = optional(payload, "telefono").unwrap_or(NOT_PROVIDED);

    let text = format!(
        "Nuevo mensaje de contacto\n\n\
         Nombre: {nombre}\n\
         Email: {email}\n\
         Teléfono: {telefono}\n\n\
         Mensaje:\n{mensaje}\n"
    );

    let html = layout(
        "Nuevo contacto",
        &format!(
            "<table style=\"width:100%;border-collapse:collapse\">\
             <tr><td style=\"font-weight:600;padding:4px 8px\">Nombre</td><td>{nombre}</td></tr>\
             <tr><td style=\"font-weight:600;padding:4px 8px\">Email</td>\
             <td><a href=\"mailto:{email}\">{email}</a></td></tr>\
             <tr><td style=\"font-weight:600;padding:4px 8px\">Teléfono</td><td>{telefono}</td></tr>\
             </table>\
             <h3>Mensaje</h3>\
             <p style=\"white-space:pre-wrap\">{mensaje}</p>",
            nombre = escape_html(nombre),
            email = escape_html(email),
            telefono = escape_html(telefono),
            mensaje = escape_html(mensaje),
        ),
    );

    Ok(RenderedEmail {
        subject: format!("Nuevo contacto de {nombre}"),
        text,
        html,
        reply_to: Some(email.to_string()),
    })
}

fn contact_confirmation(payload: &Map<String, Value>) -> Result<RenderedEmail> {
    let nombre = required(payload, "nombre")?;

    let text = format!(
        "¡Hola {nombre}!\n\n\
         Hemos recibido tu mensaje. Nuestro equipo lo revisará y te responderá lo antes posible.\n\n\
         Gracias por contactar con ZeroWork.\n"
    );

    let html = layout(
        "Mensaje recibido",
        &format!(
            "<p>¡Hola <strong>{nombre}</strong>!</p>\
             <p>Hemos recibido tu mensaje. Nuestro equipo lo revisará y te responderá lo antes posible.</p>\
             <p>Gracias por contactar con ZeroWork.</p>",
            nombre = escape_html(nombre),
        ),
    );

    Ok(RenderedEmail {
        subject: format!("Mensaje recibido - Gracias {nombre}"),
        text,
        html,
        reply_to: None,
    })
}

fn layout(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\
         <html lang=\"es\"><head><meta charset=\"UTF-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\
         <title>{title}</title></head>\
         <body style=\"font-family:'Segoe UI',Tahoma,Geneva,Verdana,sans-serif;\
         background:#0f172a;color:#f3f4f6;padding:20px\">\
         <div style=\"max-width:600px;margin:0 auto;background:#1e1b4b;border-radius:16px;\
         border:1px solid rgba(168,85,247,0.3);overflow:hidden\">\
         <div style=\"background:linear-gradient(90deg,#fbbf24,#f472b6,#a855f7);padding:24px;\
         text-align:center\"><h1 style=\"margin:0;color:#ffffff\">{title}</h1></div>\
         <div style=\"padding:32px 24px;line-height:1.6\">{body}</div>\
         <div style=\"padding:16px;text-align:center;color:#9ca3af;font-size:13px\">ZeroWork</div>\
         </div></body></html>"
    )
}

fn required<'a>(payload: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    optional(payload, key).ok_or_else(|| anyhow!("missing `{key}` in email payload"))
}

fn optional<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Escape text for interpolation into HTML element content and attributes.
#[must_use]
pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
