use async_imap::imap_proto::{BodyContentCommon, BodyStructure};
use mail_parser::{Message, MessagePart, MimeHeaders, PartType};

use crate::types::{Attachment, AttachmentInfo, Email, EmailBodyInfo, FetchOptions};

// ---------- Structure-only path ----------

/// Owned snapshot of one node of a message's BODYSTRUCTURE tree. Built
/// once from the transport's parsed response so the walk below never
/// touches protocol-library types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StructureNode {
    pub ty: String,
    pub subtype: String,
    /// Lowercased disposition type ("attachment", "inline", ...).
    pub disposition: Option<String>,
    /// "filename" parameter of the disposition.
    pub file_name: Option<String>,
    /// "name" parameter of the content type, the fallback file name.
    pub name_param: Option<String>,
    pub size: u32,
    pub lines: u32,
    pub children: Vec<StructureNode>,
}

/// Convert the transport's BODYSTRUCTURE into an owned node tree.
pub(crate) fn structure_from_proto(bs: &BodyStructure<'_>) -> StructureNode {
    match bs {
        BodyStructure::Multipart { common, bodies, .. } => {
            let mut node = structure_leaf(common, 0, 0);
            node.children = bodies.iter().map(structure_from_proto).collect();
            node
        }
        BodyStructure::Text {
            common,
            other,
            lines,
            ..
        } => structure_leaf(common, other.octets, *lines),
        BodyStructure::Basic { common, other, .. } => structure_leaf(common, other.octets, 0),
        BodyStructure::Message { common, other, .. } => structure_leaf(common, other.octets, 0),
    }
}

fn structure_leaf(common: &BodyContentCommon<'_>, size: u32, lines: u32) -> StructureNode {
    StructureNode {
        ty: common.ty.ty.to_ascii_lowercase(),
        subtype: common.ty.subtype.to_ascii_lowercase(),
        disposition: common
            .disposition
            .as_ref()
            .map(|d| d.ty.to_ascii_lowercase()),
        file_name: common
            .disposition
            .as_ref()
            .and_then(|d| body_param(&d.params, "filename")),
        name_param: body_param(&common.ty.params, "name"),
        size,
        lines,
        children: Vec::new(),
    }
}

fn body_param(
    params: &Option<Vec<(std::borrow::Cow<'_, str>, std::borrow::Cow<'_, str>)>>,
    key: &str,
) -> Option<String> {
    params.as_ref().and_then(|params| {
        params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.to_string())
    })
}

/// Populate body infos and attachment infos from the body structure alone,
/// without transferring any part content.
pub(crate) fn apply_structure(mail: &mut Email, root: &StructureNode) {
    mail.content_type = Some(format!("{}/{}", root.ty, root.subtype));
    walk_structure(mail, root);
}

fn walk_structure(mail: &mut Email, node: &StructureNode) {
    if !node.children.is_empty() {
        for child in &node.children {
            walk_structure(mail, child);
        }
    } else if node.disposition.as_deref() == Some("attachment") {
        add_attachment_info(mail, node);
    } else if node.ty == "text" {
        set_body_info(mail, node);
    }
}

fn set_body_info(mail: &mut Email, node: &StructureNode) {
    let info = EmailBodyInfo {
        size: node.size,
        line_count: node.lines,
    };
    match node.subtype.as_str() {
        "plain" => mail.plain_text_body_info = Some(info),
        "html" => mail.html_body_info = Some(info),
        _ => {}
    }
}

fn add_attachment_info(mail: &mut Email, node: &StructureNode) {
    let file_name = match node.file_name.clone().or_else(|| node.name_param.clone()) {
        Some(name) => name,
        None => {
            log::warn!(
                "attachment part ({}/{}) carries no file name",
                node.ty,
                node.subtype
            );
            String::new()
        }
    };
    mail.attachment_infos.push(AttachmentInfo {
        file_name,
        size: node.size,
        mime_type: format!("{}/{}", node.ty, node.subtype),
    });
}

// ---------- Content path ----------

/// Populate bodies and attachments from a fully fetched, parsed message,
/// according to the options' toggles.
pub(crate) fn apply_content(mail: &mut Email, message: &Message<'_>, options: &FetchOptions) {
    let root_type = message
        .parts
        .first()
        .map(part_content_type)
        .unwrap_or_else(|| "text/plain".to_string());
    mail.content_type = Some(root_type);
    walk_part(mail, message, 0, 1, options);
}

fn walk_part(
    mail: &mut Email,
    message: &Message<'_>,
    part_id: usize,
    sibling_index: usize,
    options: &FetchOptions,
) {
    let Some(part) = message.parts.get(part_id) else {
        return;
    };
    let content_type = part_content_type(part);
    let is_attachment = part
        .content_disposition()
        .map_or(false, |cd| cd.ctype().eq_ignore_ascii_case("attachment"));

    match &part.body {
        PartType::Multipart(children) => {
            for (index, child) in children.iter().enumerate() {
                walk_part(mail, message, *child, index + 1, options);
            }
        }
        _ if !is_attachment && content_type.starts_with("text/") => {
            if options.retrieve_plain_text_bodies || options.retrieve_html_bodies {
                set_text_body(mail, &content_type, part, options);
            }
        }
        _ if is_attachment
            && (options.retrieve_attachment_infos || options.download_attachments) =>
        {
            record_attachment(mail, part, content_type, sibling_index, options);
        }
        _ => {
            log::debug!("cannot map message part content type {content_type}");
        }
    }
}

fn set_text_body(mail: &mut Email, content_type: &str, part: &MessagePart<'_>, options: &FetchOptions) {
    if content_type.starts_with("text/plain") {
        if options.retrieve_plain_text_bodies {
            mail.plain_text_body = Some(part_text(part));
            // A multipart message whose only captured body is plain text
            // collapses to text/plain; a type already resolved to html is
            // never downgraded.
            if mail
                .content_type
                .as_deref()
                .is_some_and(|c| c.starts_with("multipart"))
            {
                mail.content_type = Some("text/plain".to_string());
            }
        }
    } else if content_type.starts_with("text/html") && options.retrieve_html_bodies {
        mail.html_body = Some(part_text(part));
        mail.content_type = Some("text/html".to_string());
    }
}

fn record_attachment(
    mail: &mut Email,
    part: &MessagePart<'_>,
    mime_type: String,
    sibling_index: usize,
    options: &FetchOptions,
) {
    let file_name = match part.attachment_name() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            log::warn!("attachment part {sibling_index} ({mime_type}) carries no file name");
            format!("Attachment_{sibling_index}")
        }
    };
    let size = part_len(part) as u32;

    if options.retrieve_attachment_infos {
        mail.attachment_infos.push(AttachmentInfo {
            file_name: file_name.clone(),
            size,
            mime_type: mime_type.clone(),
        });
    }
    if options.download_attachments {
        mail.attachments.push(Attachment {
            file_name,
            size,
            mime_type,
            content: part_bytes(part),
        });
    }
}

/// Content type of a part as "type/subtype", lowercased and free of
/// parameters. Parts without a Content-Type header default to text/plain.
fn part_content_type(part: &MessagePart<'_>) -> String {
    match part.content_type() {
        Some(ct) => match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype).to_ascii_lowercase(),
            None => ct.ctype().to_ascii_lowercase(),
        },
        None => "text/plain".to_string(),
    }
}

fn part_text(part: &MessagePart<'_>) -> String {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.as_ref().to_string(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        PartType::Message(nested) => String::from_utf8_lossy(&nested.raw_message).into_owned(),
        _ => String::new(),
    }
}

fn part_bytes(part: &MessagePart<'_>) -> Vec<u8> {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.as_bytes().to_vec(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => bytes.to_vec(),
        PartType::Message(nested) => nested.raw_message.to_vec(),
        _ => Vec::new(),
    }
}

fn part_len(part: &MessagePart<'_>) -> usize {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => text.len(),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => bytes.len(),
        PartType::Message(nested) => nested.raw_message.len(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MailAccount, MessageSelection};
    use mail_parser::MessageParser;

    fn options() -> FetchOptions {
        let _ = env_logger::builder().is_test(true).try_init();
        let account = MailAccount::new("user@example.com", "secret", "mail.example.com", 993);
        let mut options = FetchOptions::new(account);
        options.selection = MessageSelection::All;
        options
    }

    fn text_node(subtype: &str, size: u32, lines: u32) -> StructureNode {
        StructureNode {
            ty: "text".to_string(),
            subtype: subtype.to_string(),
            size,
            lines,
            ..Default::default()
        }
    }

    fn attachment_node(ty: &str, subtype: &str, file_name: Option<&str>, size: u32) -> StructureNode {
        StructureNode {
            ty: ty.to_string(),
            subtype: subtype.to_string(),
            disposition: Some("attachment".to_string()),
            file_name: file_name.map(str::to_string),
            size,
            ..Default::default()
        }
    }

    fn multipart_node(subtype: &str, children: Vec<StructureNode>) -> StructureNode {
        StructureNode {
            ty: "multipart".to_string(),
            subtype: subtype.to_string(),
            children,
            ..Default::default()
        }
    }

    #[test]
    fn structure_walk_collects_body_infos_and_attachment_infos() {
        let root = multipart_node(
            "mixed",
            vec![
                multipart_node(
                    "alternative",
                    vec![text_node("plain", 120, 4), text_node("html", 480, 12)],
                ),
                attachment_node("application", "pdf", Some("report.pdf"), 2048),
            ],
        );

        let mut mail = Email::default();
        apply_structure(&mut mail, &root);

        assert_eq!(mail.content_type.as_deref(), Some("multipart/mixed"));
        assert_eq!(
            mail.plain_text_body_info,
            Some(EmailBodyInfo {
                size: 120,
                line_count: 4
            })
        );
        assert_eq!(
            mail.html_body_info,
            Some(EmailBodyInfo {
                size: 480,
                line_count: 12
            })
        );
        assert_eq!(mail.attachment_infos.len(), 1);
        let info = &mail.attachment_infos[0];
        assert_eq!(info.file_name, "report.pdf");
        assert_eq!(info.mime_type, "application/pdf");
        assert_eq!(info.size, 2048);
        // The structure path never materializes content.
        assert!(mail.attachments.is_empty());
        assert!(mail.plain_text_body.is_none());
        assert!(mail.html_body.is_none());
    }

    #[test]
    fn structure_walk_file_name_falls_back_to_name_param_then_empty() {
        let mut with_name_param = attachment_node("image", "png", None, 64);
        with_name_param.name_param = Some("chart.png".to_string());
        let nameless = attachment_node("application", "octet-stream", None, 16);

        let root = multipart_node("mixed", vec![with_name_param, nameless]);
        let mut mail = Email::default();
        apply_structure(&mut mail, &root);

        assert_eq!(mail.attachment_infos[0].file_name, "chart.png");
        assert_eq!(mail.attachment_infos[1].file_name, "");
    }

    #[test]
    fn structure_walk_ignores_other_text_subtypes() {
        let root = multipart_node("mixed", vec![text_node("calendar", 300, 10)]);
        let mut mail = Email::default();
        apply_structure(&mut mail, &root);

        assert!(mail.plain_text_body_info.is_none());
        assert!(mail.html_body_info.is_none());
        assert!(mail.attachment_infos.is_empty());
    }

    const MULTIPART_MESSAGE: &str = concat!(
        "From: Alice <alice@example.com>\r\n",
        "To: Bob <bob@example.com>\r\n",
        "Subject: Report\r\n",
        "Date: Mon, 2 Mar 2020 10:00:00 +0000\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "--outer\r\n",
        "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "hello plain\r\n",
        "--inner\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<p>hello html</p>\r\n",
        "--inner--\r\n",
        "--outer\r\n",
        "Content-Type: application/pdf; name=\"report.pdf\"\r\n",
        "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "JVBERi0xLjQ=\r\n",
        "--outer--\r\n",
    );

    const NAMELESS_ATTACHMENT_MESSAGE: &str = concat!(
        "From: Alice <alice@example.com>\r\n",
        "To: Bob <bob@example.com>\r\n",
        "Subject: Data\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "see attachment\r\n",
        "--b\r\n",
        "Content-Type: application/octet-stream\r\n",
        "Content-Disposition: attachment\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "AAECAw==\r\n",
        "--b--\r\n",
    );

    const HTML_BEFORE_PLAIN_MESSAGE: &str = concat!(
        "From: Alice <alice@example.com>\r\n",
        "Subject: Alt\r\n",
        "MIME-Version: 1.0\r\n",
        "Content-Type: multipart/alternative; boundary=\"alt\"\r\n",
        "\r\n",
        "--alt\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<b>first</b>\r\n",
        "--alt\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "second\r\n",
        "--alt--\r\n",
    );

    #[test]
    fn content_walk_extracts_bodies_and_downloads_attachments() {
        let parser = MessageParser::default();
        let message = parser
            .parse(MULTIPART_MESSAGE.as_bytes())
            .expect("test message should parse");

        let mut opts = options();
        opts.retrieve_plain_text_bodies = true;
        opts.retrieve_html_bodies = true;
        opts.retrieve_attachment_infos = true;
        opts.download_attachments = true;

        let mut mail = Email::default();
        apply_content(&mut mail, &message, &opts);

        assert!(mail
            .plain_text_body
            .as_deref()
            .is_some_and(|b| b.contains("hello plain")));
        assert!(mail
            .html_body
            .as_deref()
            .is_some_and(|b| b.contains("hello html")));
        // HTML was captured, so the derived type resolves to text/html.
        assert_eq!(mail.content_type.as_deref(), Some("text/html"));

        assert_eq!(mail.attachment_infos.len(), 1);
        assert_eq!(mail.attachment_infos[0].file_name, "report.pdf");
        assert_eq!(mail.attachment_infos[0].mime_type, "application/pdf");

        assert_eq!(mail.attachments.len(), 1);
        assert_eq!(mail.attachments[0].content, b"%PDF-1.4");
        assert!(mail.attachments[0].size > 0);
    }

    #[test]
    fn content_walk_download_only_leaves_infos_empty() {
        let parser = MessageParser::default();
        let message = parser
            .parse(MULTIPART_MESSAGE.as_bytes())
            .expect("test message should parse");

        let mut opts = options();
        opts.download_attachments = true;

        let mut mail = Email::default();
        apply_content(&mut mail, &message, &opts);

        assert!(mail.attachment_infos.is_empty());
        assert_eq!(mail.attachments.len(), 1);
        assert!(!mail.attachments[0].content.is_empty());
        // No body toggle was set.
        assert!(mail.body().is_none());
    }

    #[test]
    fn content_walk_plain_only_collapses_multipart_content_type() {
        let parser = MessageParser::default();
        let message = parser
            .parse(MULTIPART_MESSAGE.as_bytes())
            .expect("test message should parse");

        let mut opts = options();
        opts.retrieve_plain_text_bodies = true;

        let mut mail = Email::default();
        apply_content(&mut mail, &message, &opts);

        assert!(mail.plain_text_body.is_some());
        assert!(mail.html_body.is_none());
        assert_eq!(mail.content_type.as_deref(), Some("text/plain"));
        // Attachment toggles are off, so attachment parts are skipped.
        assert!(mail.attachment_infos.is_empty());
        assert!(mail.attachments.is_empty());
    }

    #[test]
    fn content_walk_synthesizes_missing_attachment_names() {
        let parser = MessageParser::default();
        let message = parser
            .parse(NAMELESS_ATTACHMENT_MESSAGE.as_bytes())
            .expect("test message should parse");

        let mut opts = options();
        opts.retrieve_attachment_infos = true;
        opts.download_attachments = true;

        let mut mail = Email::default();
        apply_content(&mut mail, &message, &opts);

        assert_eq!(mail.attachment_infos.len(), 1);
        // Second child of the multipart container, 1-based.
        assert_eq!(mail.attachment_infos[0].file_name, "Attachment_2");
        assert_eq!(mail.attachments[0].content, vec![0u8, 1, 2, 3]);
    }

    #[test]
    fn content_walk_never_downgrades_html_content_type() {
        let parser = MessageParser::default();
        let message = parser
            .parse(HTML_BEFORE_PLAIN_MESSAGE.as_bytes())
            .expect("test message should parse");

        let mut opts = options();
        opts.retrieve_plain_text_bodies = true;
        opts.retrieve_html_bodies = true;

        let mut mail = Email::default();
        apply_content(&mut mail, &message, &opts);

        assert!(mail.plain_text_body.is_some());
        assert!(mail.html_body.is_some());
        // The plain part was captured after html, but html is sticky.
        assert_eq!(mail.content_type.as_deref(), Some("text/html"));
        // body() still prefers the plain text rendition.
        assert!(mail.body().is_some_and(|b| b.contains("second")));
    }

    #[test]
    fn content_walk_respects_single_body_toggle() {
        let parser = MessageParser::default();
        let message = parser
            .parse(MULTIPART_MESSAGE.as_bytes())
            .expect("test message should parse");

        let mut opts = options();
        opts.retrieve_html_bodies = true;

        let mut mail = Email::default();
        apply_content(&mut mail, &message, &opts);

        assert!(mail.plain_text_body.is_none());
        assert!(mail.html_body.is_some());
        assert_eq!(mail.content_type.as_deref(), Some("text/html"));
    }
}
