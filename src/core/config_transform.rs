//! 伺服器設定檔 (server_config.xml) 的串流改寫。
//!
//! 三個獨立的步驟：改寫連接埠、抽出內容引用、回填下載成功的路徑。
//! 未被觸及的元素與屬性原樣輸出 (包含順序)。

use crate::domain::model::{ContentKind, ContentReference};
use crate::utils::error::{Result, SupervisorError};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

pub const ROOT_ELEMENT: &str = "server_data";
pub const PORT_ATTRIBUTE: &str = "port";
pub const PATH_ELEMENT: &str = "path";
pub const PATH_ATTRIBUTE: &str = "path";

static CONTENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("content id pattern is valid"));

/// 內容 ID 只由數字組成；其他值都是一般檔案路徑
pub fn is_content_id(value: &str) -> bool {
    CONTENT_ID.is_match(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub document: String,
    pub references: Vec<ContentReference>,
}

impl Extraction {
    pub fn ids_of(&self, kind: ContentKind) -> Vec<&str> {
        self.references
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.id.as_str())
            .collect()
    }

    pub fn playlist_ids(&self) -> Vec<&str> {
        self.ids_of(ContentKind::Playlist)
    }

    pub fn mod_ids(&self) -> Vec<&str> {
        self.ids_of(ContentKind::Mod)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reinsertion {
    pub document: String,
    pub inserted: Vec<ContentReference>,
    /// 請求過但沒有回填的 ID (依出現順序、去重)
    pub failed_ids: Vec<String>,
}

/// 回填路徑的格式；下游遊戲伺服器依賴這個格式
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePaths {
    playlist_root: String,
    mod_root: String,
}

impl ReferencePaths {
    pub fn new(playlist_root: impl Into<String>, mod_root: impl Into<String>) -> Self {
        Self {
            playlist_root: playlist_root.into(),
            mod_root: mod_root.into(),
        }
    }

    pub fn path_for(&self, reference: &ContentReference) -> String {
        match reference.kind {
            ContentKind::Playlist => format!(
                "{}/{}",
                self.playlist_root.replace('\\', "/").trim_end_matches('/'),
                reference.id
            ),
            ContentKind::Mod => format!(
                "{}\\{}",
                self.mod_root.replace('/', "\\").trim_end_matches('\\'),
                reference.id
            ),
        }
    }
}

impl Default for ReferencePaths {
    fn default() -> Self {
        Self::new("/rom/data/workshop_missions", "rom\\data\\workshop_mods")
    }
}

/// 將根元素的 port 屬性設為指定值 (不存在則新增)
pub fn rewrite_port(document: &str, port: u16) -> Result<String> {
    let mut rewriter = Rewriter::new(document);
    let port_value = port.to_string();
    let mut rewritten_root = false;

    while let Some((event, level)) = rewriter.next()? {
        match event {
            Event::Start(start) if level == 0 => {
                let start = with_port(&start, &port_value)?;
                rewritten_root = true;
                rewriter.write(Event::Start(start))?;
            }
            Event::Empty(start) if level == 0 => {
                let start = with_port(&start, &port_value)?;
                rewritten_root = true;
                rewriter.write(Event::Empty(start))?;
            }
            other => rewriter.write(other)?,
        }
    }

    if !rewritten_root {
        return Err(SupervisorError::config_parse("document has no root element"));
    }
    tracing::debug!(port, "Rewrote server port attribute");
    rewriter.finish()
}

fn with_port(start: &BytesStart<'_>, port: &str) -> Result<BytesStart<'static>> {
    if start.name().as_ref() != ROOT_ELEMENT.as_bytes() {
        return Err(SupervisorError::config_parse(format!(
            "root element must be <{}>, found <{}>",
            ROOT_ELEMENT,
            String::from_utf8_lossy(start.name().as_ref())
        )));
    }

    let mut rewritten = start.to_owned();
    rewritten.clear_attributes();

    let mut replaced = false;
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SupervisorError::config_parse(e.to_string()))?;
        if attr.key.as_ref() == PORT_ATTRIBUTE.as_bytes() {
            rewritten.push_attribute((PORT_ATTRIBUTE, port));
            replaced = true;
        } else {
            push_preserved(&mut rewritten, attr)?;
        }
    }
    if !replaced {
        rewritten.push_attribute((PORT_ATTRIBUTE, port));
    }
    Ok(rewritten)
}

/// 原樣保留屬性；值內含雙引號時 (原本以單引號包住) 改為重新跳脫
fn push_preserved(start: &mut BytesStart<'static>, attr: Attribute<'_>) -> Result<()> {
    if attr.value.contains(&b'"') {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| SupervisorError::config_parse(e.to_string()))?
            .into_owned();
        start.push_attribute((key.as_str(), value.as_str()));
    } else {
        start.push_attribute(attr);
    }
    Ok(())
}

/// 抽出 `<playlists>` / `<mods>` 內 path 屬性為純數字的元素，並自輸出中移除
pub fn extract_references(document: &str) -> Result<Extraction> {
    let mut rewriter = Rewriter::new(document);
    let mut references = Vec::new();
    // (種類, 容器所在層級)
    let mut container: Option<(ContentKind, usize)> = None;
    // 正在略過的元素層級
    let mut skipping: Option<usize> = None;
    // 容器內尚未輸出的空白，若下一個元素被移除則一併丟棄
    let mut pending_whitespace: Option<Event<'_>> = None;

    while let Some((event, level)) = rewriter.next()? {
        if let Some(skip_level) = skipping {
            if matches!(event, Event::End(_)) && level == skip_level {
                skipping = None;
            }
            continue;
        }

        match event {
            Event::Start(ref start) | Event::Empty(ref start) if container.is_some() => {
                let kind = container.map(|(kind, _)| kind);
                if let (Some(kind), Some(id)) = (kind, content_id_of(start)?) {
                    tracing::debug!(%kind, id = %id, "Extracted content reference");
                    references.push(ContentReference::new(id, kind));
                    pending_whitespace = None;
                    if matches!(event, Event::Start(_)) {
                        skipping = Some(level);
                    }
                    continue;
                }
                if let Some(whitespace) = pending_whitespace.take() {
                    rewriter.write(whitespace)?;
                }
                rewriter.write(event)?;
            }
            Event::Start(ref start) => {
                if let Some(kind) = ContentKind::from_container_name(start.name().as_ref()) {
                    container = Some((kind, level));
                }
                rewriter.write(event)?;
            }
            Event::Text(ref text) if container.is_some() && is_whitespace(text) => {
                if let Some(previous) = pending_whitespace.replace(event) {
                    rewriter.write(previous)?;
                }
            }
            other => {
                if let Some(whitespace) = pending_whitespace.take() {
                    rewriter.write(whitespace)?;
                }
                if let (Event::End(_), Some((_, container_level))) = (&other, container) {
                    if level == container_level {
                        container = None;
                    }
                }
                rewriter.write(other)?;
            }
        }
    }
    if let Some(whitespace) = pending_whitespace.take() {
        rewriter.write(whitespace)?;
    }

    tracing::debug!(
        references = references.len(),
        "Content reference extraction finished"
    );
    Ok(Extraction {
        document: rewriter.finish()?,
        references,
    })
}

fn content_id_of(start: &BytesStart<'_>) -> Result<Option<String>> {
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SupervisorError::config_parse(e.to_string()))?;
        if attr.key.as_ref() != PATH_ATTRIBUTE.as_bytes() {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| SupervisorError::config_parse(e.to_string()))?;
        if is_content_id(&value) {
            return Ok(Some(value.into_owned()));
        }
        tracing::debug!(path = %value, "Keeping filesystem path reference");
        return Ok(None);
    }
    Ok(None)
}

fn is_whitespace(text: &quick_xml::events::BytesText<'_>) -> bool {
    text.iter().all(|b| b.is_ascii_whitespace())
}

/// 在每種容器的結束標籤前插入下載成功的引用。
///
/// 同種類有多個容器時只插入第一個，避免重複引用。
pub fn reinsert_references(
    document: &str,
    requested: &[ContentReference],
    succeeded: &HashSet<ContentReference>,
    paths: &ReferencePaths,
) -> Result<Reinsertion> {
    let mut rewriter = Rewriter::new(document);
    let mut seen = HashSet::new();
    let successful: Vec<&ContentReference> = requested
        .iter()
        .filter(|r| succeeded.contains(*r) && seen.insert(*r))
        .collect();

    let mut inserted: Vec<ContentReference> = Vec::new();
    let mut filled: HashSet<ContentKind> = HashSet::new();
    let mut open_containers: Vec<(ContentKind, usize)> = Vec::new();

    while let Some((event, level)) = rewriter.next()? {
        match event {
            Event::Start(ref start) => {
                if let Some(kind) = ContentKind::from_container_name(start.name().as_ref()) {
                    open_containers.push((kind, level));
                }
                rewriter.write(event)?;
            }
            Event::End(ref end)
                if open_containers
                    .last()
                    .is_some_and(|(_, container_level)| *container_level == level) =>
            {
                if let Some((kind, _)) = open_containers.pop() {
                    if filled.insert(kind) {
                        insert_paths(&mut rewriter, kind, &successful, paths, &mut inserted)?;
                    }
                }
                rewriter.write(Event::End(end.clone()))?;
            }
            Event::Empty(ref start) => {
                match ContentKind::from_container_name(start.name().as_ref()) {
                    Some(kind) if !filled.contains(&kind) && successful.iter().any(|r| r.kind == kind) => {
                        // `<mods/>` 展開成開始與結束標籤
                        filled.insert(kind);
                        let end = BytesEnd::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
                        rewriter.write(Event::Start(start.clone()))?;
                        insert_paths(&mut rewriter, kind, &successful, paths, &mut inserted)?;
                        rewriter.write(Event::End(end))?;
                    }
                    _ => rewriter.write(event)?,
                }
            }
            other => rewriter.write(other)?,
        }
    }

    let mut reported = HashSet::new();
    let failed_ids: Vec<String> = requested
        .iter()
        .filter(|r| !inserted.contains(*r))
        .filter(|r| reported.insert(r.id.as_str()))
        .map(|r| r.id.clone())
        .collect();

    tracing::debug!(
        inserted = inserted.len(),
        failed = failed_ids.len(),
        "Content reference reinsertion finished"
    );
    Ok(Reinsertion {
        document: rewriter.finish()?,
        inserted,
        failed_ids,
    })
}

fn insert_paths(
    rewriter: &mut Rewriter<'_>,
    kind: ContentKind,
    successful: &[&ContentReference],
    paths: &ReferencePaths,
    inserted: &mut Vec<ContentReference>,
) -> Result<()> {
    for reference in successful.iter().filter(|r| r.kind == kind) {
        let path = paths.path_for(reference);
        let mut element = BytesStart::new(PATH_ELEMENT);
        element.push_attribute((PATH_ATTRIBUTE, path.as_str()));
        rewriter.write(Event::Empty(element))?;
        tracing::debug!(%kind, id = %reference.id, path = %path, "Reinserted content path");
        inserted.push((*reference).clone());
    }
    Ok(())
}

/// 逐事件讀寫並追蹤巢狀層級
struct Rewriter<'a> {
    reader: Reader<&'a [u8]>,
    writer: Writer<Vec<u8>>,
    depth: usize,
    saw_root: bool,
}

impl<'a> Rewriter<'a> {
    fn new(document: &'a str) -> Self {
        Self {
            reader: Reader::from_str(document),
            writer: Writer::new(Vec::with_capacity(document.len())),
            depth: 0,
            saw_root: false,
        }
    }

    /// 回傳事件與其所在層級 (根元素為 0)；文件結束時為 None
    fn next(&mut self) -> Result<Option<(Event<'a>, usize)>> {
        let event = self.reader.read_event().map_err(|e| {
            SupervisorError::config_parse(format!(
                "{} at position {}",
                e,
                self.reader.buffer_position()
            ))
        })?;

        let level = match &event {
            Event::Start(_) => {
                self.saw_root = true;
                self.depth += 1;
                self.depth - 1
            }
            Event::End(_) => {
                self.depth = self.depth.checked_sub(1).ok_or_else(|| {
                    SupervisorError::config_parse("closing tag without matching opening tag")
                })?;
                self.depth
            }
            Event::Empty(_) => {
                self.saw_root = true;
                self.depth
            }
            Event::Eof => {
                if self.depth != 0 {
                    return Err(SupervisorError::config_parse(format!(
                        "unexpected end of document with {} unclosed element(s)",
                        self.depth
                    )));
                }
                if !self.saw_root {
                    return Err(SupervisorError::config_parse("document has no root element"));
                }
                return Ok(None);
            }
            _ => self.depth,
        };
        Ok(Some((event, level)))
    }

    fn write(&mut self, event: Event<'_>) -> Result<()> {
        self.writer
            .write_event(event)
            .map_err(|e| SupervisorError::config_parse(format!("failed to write document: {}", e)))
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| SupervisorError::config_parse(format!("document is not valid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_content_id() {
        assert!(is_content_id("123"));
        assert!(is_content_id("2857203401"));
        assert!(!is_content_id(""));
        assert!(!is_content_id("abc"));
        assert!(!is_content_id("12a"));
        assert!(!is_content_id("rom/data/123"));
        assert!(!is_content_id("١٢٣"));
    }

    #[test]
    fn test_rewrite_port_replaces_existing_attribute_in_place() {
        let doc = r#"<server_data name="alpha" port="0" seed="7"><x/></server_data>"#;
        let rewritten = rewrite_port(doc, 8000).unwrap();
        assert_eq!(
            rewritten,
            r#"<server_data name="alpha" port="8000" seed="7"><x/></server_data>"#
        );
    }

    #[test]
    fn test_rewrite_port_adds_missing_attribute() {
        let rewritten = rewrite_port(r#"<server_data name="alpha"/>"#, 9000).unwrap();
        assert_eq!(rewritten, r#"<server_data name="alpha" port="9000"/>"#);
    }

    #[test]
    fn test_rewrite_port_keeps_declaration_and_comments() {
        let doc = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<!-- keep -->\n<server_data port=\"1\">\n  <admins/>\n</server_data>\n";
        let rewritten = rewrite_port(doc, 9001).unwrap();
        assert_eq!(rewritten, doc.replace("port=\"1\"", "port=\"9001\""));
    }

    #[test]
    fn test_rewrite_port_rejects_other_roots_and_malformed_input() {
        assert!(matches!(
            rewrite_port("<config port=\"1\"/>", 9000),
            Err(SupervisorError::ConfigParse { .. })
        ));
        assert!(rewrite_port("<server_data><mods></server_data>", 9000).is_err());
        assert!(rewrite_port("<server_data>", 9000).is_err());
        assert!(rewrite_port("", 9000).is_err());
    }

    #[test]
    fn test_extract_references_keeps_filesystem_paths() {
        let doc = r#"<server_data port="8000"><playlists><path path="123"/><path path="abc"/></playlists><mods><path path="456"/><path path="C:\mods\local"/></mods></server_data>"#;
        let extraction = extract_references(doc).unwrap();

        assert_eq!(extraction.playlist_ids(), vec!["123"]);
        assert_eq!(extraction.mod_ids(), vec!["456"]);
        assert_eq!(
            extraction.document,
            r#"<server_data port="8000"><playlists><path path="abc"/></playlists><mods><path path="C:\mods\local"/></mods></server_data>"#
        );
    }

    #[test]
    fn test_extract_references_preserves_duplicates_and_order() {
        let doc = r#"<server_data><mods><path path="2"/><path path="1"/><path path="2"/></mods></server_data>"#;
        let extraction = extract_references(doc).unwrap();
        assert_eq!(extraction.mod_ids(), vec!["2", "1", "2"]);
        assert_eq!(extraction.document, "<server_data><mods></mods></server_data>");
    }

    #[test]
    fn test_extract_references_drops_nested_content_and_whitespace() {
        let doc = "<server_data>\n  <playlists>\n    <path path=\"77\">\n      <note/>\n    </path>\n    <path path=\"rom/data/missions/local\"/>\n  </playlists>\n</server_data>";
        let extraction = extract_references(doc).unwrap();
        assert_eq!(extraction.playlist_ids(), vec!["77"]);
        assert_eq!(
            extraction.document,
            "<server_data>\n  <playlists>\n    <path path=\"rom/data/missions/local\"/>\n  </playlists>\n</server_data>"
        );
    }

    #[test]
    fn test_extract_references_ignores_numeric_paths_outside_containers() {
        let doc = r#"<server_data><path path="123"/><other><path path="9"/></other></server_data>"#;
        let extraction = extract_references(doc).unwrap();
        assert!(extraction.references.is_empty());
        assert_eq!(extraction.document, doc);
    }

    #[test]
    fn test_reinsert_references_only_for_successes() {
        let doc = r#"<server_data port="8000"><playlists><path path="abc"/></playlists><mods></mods></server_data>"#;
        let requested = vec![
            ContentReference::playlist("123"),
            ContentReference::module("456"),
            ContentReference::module("789"),
        ];
        let succeeded: HashSet<_> = [
            ContentReference::playlist("123"),
            ContentReference::module("456"),
        ]
        .into_iter()
        .collect();
        let paths = ReferencePaths::new("/rom/data/workshop_missions", "C:/server/workshop_mods/");

        let result = reinsert_references(doc, &requested, &succeeded, &paths).unwrap();
        assert_eq!(
            result.document,
            r#"<server_data port="8000"><playlists><path path="abc"/><path path="/rom/data/workshop_missions/123"/></playlists><mods><path path="C:\server\workshop_mods\456"/></mods></server_data>"#
        );
        assert_eq!(result.failed_ids, vec!["789".to_string()]);
        assert_eq!(result.inserted.len(), 2);
    }

    #[test]
    fn test_reinsert_expands_self_closing_container() {
        let requested = vec![ContentReference::module("5")];
        let succeeded: HashSet<_> = requested.iter().cloned().collect();
        let result = reinsert_references(
            "<server_data><mods/></server_data>",
            &requested,
            &succeeded,
            &ReferencePaths::new("/p", "m"),
        )
        .unwrap();
        assert_eq!(
            result.document,
            r#"<server_data><mods><path path="m\5"/></mods></server_data>"#
        );
        assert!(result.failed_ids.is_empty());
    }

    #[test]
    fn test_reinsert_deduplicates_ids() {
        let requested = vec![
            ContentReference::playlist("1"),
            ContentReference::playlist("1"),
            ContentReference::playlist("2"),
            ContentReference::playlist("2"),
        ];
        let succeeded: HashSet<_> = [ContentReference::playlist("1")].into_iter().collect();
        let result = reinsert_references(
            "<server_data><playlists></playlists></server_data>",
            &requested,
            &succeeded,
            &ReferencePaths::default(),
        )
        .unwrap();
        assert_eq!(result.inserted, vec![ContentReference::playlist("1")]);
        assert_eq!(result.failed_ids, vec!["2".to_string()]);
    }
}
