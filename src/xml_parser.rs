//! XML Parser Module
//!
//! This module decodes DMARC aggregate reports into [`DmarcReport`] values. Documents
//! are first read into a small element tree with namespaces resolved; every lookup
//! then goes through one [`Accessor`] chosen from the root element, so reports with
//! and without an XML namespace are handled identically.
//!
//! Parsing never fails past this module's boundary: a fault leaves the report with
//! whatever was decoded so far and its `error` field set. DOCTYPE declarations are
//! removed before parsing, and a DOCTYPE with two or more entity definitions is
//! rejected, as is nesting deeper than [`MAX_DEPTH`].

use crate::error::{DmarcError, Result};
use crate::models::{
    AuthResult, AuthResults, DateRange, DmarcReport, PolicyPublished, Record, ReportMetadata,
    ReportSummary, Row,
};
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;
use std::borrow::Cow;
use std::path::Path;

/// Maximum element nesting accepted in a report.
pub const MAX_DEPTH: usize = 20;

#[derive(Debug)]
struct Element {
    namespace: Option<String>,
    name: String,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    fn open(resolved: ResolveResult<'_>, local_name: &[u8]) -> Result<Self> {
        let namespace = match resolved {
            ResolveResult::Bound(ns) => Some(String::from_utf8_lossy(ns.as_ref()).into_owned()),
            ResolveResult::Unbound => None,
            ResolveResult::Unknown(prefix) => {
                return Err(DmarcError::Parse(format!(
                    "unbound namespace prefix '{}'",
                    String::from_utf8_lossy(&prefix)
                )))
            }
        };
        Ok(Element {
            namespace,
            name: String::from_utf8_lossy(local_name).into_owned(),
            text: None,
            children: Vec::new(),
        })
    }

    fn text(&self) -> String {
        self.text.clone().unwrap_or_default()
    }
}

/// Element lookup, selected once per document from its root.
#[derive(Debug, Clone, PartialEq)]
enum Accessor {
    /// Matches local names inside the root's namespace.
    Namespaced(String),
    /// Matches unqualified names.
    Bare,
}

impl Accessor {
    fn for_root(root: &Element) -> Self {
        match &root.namespace {
            Some(ns) => Accessor::Namespaced(ns.clone()),
            None => Accessor::Bare,
        }
    }

    fn matches(&self, element: &Element, name: &str) -> bool {
        if element.name != name {
            return false;
        }
        match self {
            Accessor::Namespaced(ns) => element.namespace.as_deref() == Some(ns.as_str()),
            Accessor::Bare => element.namespace.is_none(),
        }
    }

    fn child<'a>(&self, parent: &'a Element, name: &str) -> Option<&'a Element> {
        parent.children.iter().find(|c| self.matches(c, name))
    }

    fn child_text(&self, parent: &Element, name: &str) -> Option<String> {
        self.child(parent, name).map(Element::text)
    }

    /// All matching descendants of `root` in document order, `root` excluded.
    fn descendants<'a>(&self, root: &'a Element, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        let mut stack: Vec<&Element> = root.children.iter().rev().collect();
        while let Some(element) = stack.pop() {
            if self.matches(element, name) {
                found.push(element);
            }
            stack.extend(element.children.iter().rev());
        }
        found
    }

    fn descendant<'a>(&self, root: &'a Element, name: &str) -> Option<&'a Element> {
        self.descendants(root, name).into_iter().next()
    }
}

/// Parses a report file. Read failures are reported through the `error` field.
pub fn parse_report_file<P: AsRef<Path>>(path: P) -> DmarcReport {
    let path = path.as_ref();
    match std::fs::read(path) {
        Ok(bytes) => {
            let content = String::from_utf8_lossy(&bytes);
            let report = parse_dmarc_xml(content.trim_start_matches('\u{feff}'));
            if let Some(error) = &report.error {
                log::warn!("Error parsing XML {}: {}", path.display(), error);
            }
            report
        }
        Err(e) => {
            log::warn!("Error reading {}: {}", path.display(), e);
            DmarcReport {
                error: Some(DmarcError::Io(e).to_string()),
                ..DmarcReport::default()
            }
        }
    }
}

/// Parses DMARC XML content into a report.
///
/// The summary is folded from whichever records were decoded; callers must check
/// `error` before trusting the result.
pub fn parse_dmarc_xml(xml_content: &str) -> DmarcReport {
    let mut report = DmarcReport::default();
    if let Err(e) = decode(xml_content, &mut report) {
        report.error = Some(e.to_string());
    }
    match ReportSummary::from_records(&report.records) {
        Some(summary) => report.summary = summary,
        None => {
            if report.error.is_none() {
                report.error = Some(
                    DmarcError::Parse("Record counts overflow the report summary".to_string()).to_string(),
                );
            }
        }
    }
    report
}

fn decode(xml_content: &str, report: &mut DmarcReport) -> Result<()> {
    let cleaned = strip_doctype(xml_content)?;
    let root = build_tree(&cleaned)?;
    let access = Accessor::for_root(&root);

    if let Some(metadata) = access.descendant(&root, "report_metadata") {
        report.report_metadata = decode_metadata(&access, metadata);
    }
    if let Some(policy) = access.descendant(&root, "policy_published") {
        report.policy_published = decode_policy(&access, policy);
    }
    for element in access.descendants(&root, "record") {
        let record = decode_record(&access, element)?;
        report.records.push(record);
    }
    Ok(())
}

/// Removes a DOCTYPE block, rejecting it when it declares two or more entities.
fn strip_doctype(xml_content: &str) -> Result<Cow<'_, str>> {
    let Some(start) = xml_content.find("<!DOCTYPE") else {
        return Ok(Cow::Borrowed(xml_content));
    };
    let rest = &xml_content[start..];
    let Some(first_close) = rest.find('>') else {
        return Ok(Cow::Borrowed(xml_content));
    };
    let end = if rest[..first_close].contains('[') {
        match rest.find("]>") {
            Some(end) => end + 2,
            None => return Err(DmarcError::Parse("unterminated DOCTYPE".into())),
        }
    } else {
        first_close + 1
    };
    let doctype = &rest[..end];
    if doctype.matches("<!ENTITY").count() >= 2 {
        return Err(DmarcError::Parse("Recursive entities detected".into()));
    }
    Ok(Cow::Owned(format!(
        "{}{}",
        &xml_content[..start],
        &xml_content[start + end..]
    )))
}

fn build_tree(xml: &str) -> Result<Element> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (resolved, event) = reader.read_resolved_event()?;
        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(DmarcError::Parse("XML recursion depth limit exceeded".into()));
                }
                stack.push(Element::open(resolved, e.local_name().as_ref())?);
            }
            Event::Empty(e) => {
                let element = Element::open(resolved, e.local_name().as_ref())?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| DmarcError::Parse("unexpected closing tag".into()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(|e| DmarcError::Parse(e.to_string()))?;
                push_text(&mut stack, &text);
            }
            Event::CData(e) => {
                let bytes = e.into_inner();
                push_text(&mut stack, &String::from_utf8_lossy(&bytes));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(DmarcError::Parse("unexpected end of document".into()));
    }
    root.ok_or_else(|| DmarcError::Parse("document has no root element".into()))
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(DmarcError::Parse("junk after document element".into())),
    }
    Ok(())
}

// Text after the first child is ignored, as are stray text nodes outside the root.
fn push_text(stack: &mut [Element], text: &str) {
    if let Some(current) = stack.last_mut() {
        if current.children.is_empty() {
            current.text.get_or_insert_with(String::new).push_str(text);
        }
    }
}

fn decode_metadata(access: &Accessor, metadata: &Element) -> ReportMetadata {
    let defaults = ReportMetadata::default();
    let timestamp = |name: &str| {
        access
            .child(metadata, "date_range")
            .and_then(|range| access.child_text(range, name))
            .and_then(|text| text.trim().parse::<i64>().ok())
            .unwrap_or(0)
    };
    ReportMetadata {
        org_name: access.child_text(metadata, "org_name").unwrap_or(defaults.org_name),
        email: access.child_text(metadata, "email").unwrap_or(defaults.email),
        extra_contact_info: access
            .child_text(metadata, "extra_contact_info")
            .unwrap_or(defaults.extra_contact_info),
        report_id: access.child_text(metadata, "report_id").unwrap_or(defaults.report_id),
        date_range: DateRange {
            begin: timestamp("begin"),
            end: timestamp("end"),
        },
    }
}

fn decode_policy(access: &Accessor, policy: &Element) -> PolicyPublished {
    let defaults = PolicyPublished::default();
    PolicyPublished {
        domain: access.child_text(policy, "domain").unwrap_or(defaults.domain),
        adkim: access.child_text(policy, "adkim").unwrap_or(defaults.adkim),
        aspf: access.child_text(policy, "aspf").unwrap_or(defaults.aspf),
        p: access.child_text(policy, "p").unwrap_or(defaults.p),
        sp: access.child_text(policy, "sp").unwrap_or(defaults.sp),
        pct: access
            .child_text(policy, "pct")
            .and_then(|text| text.trim().parse().ok())
            .unwrap_or(defaults.pct),
    }
}

fn decode_record(access: &Accessor, element: &Element) -> Result<Record> {
    let mut record = Record::default();

    if let Some(row) = access.child(element, "row") {
        record.row = decode_row(access, row)?;
    }

    if let Some(identifiers) = access.child(element, "identifiers") {
        if let Some(header_from) = access.child_text(identifiers, "header_from") {
            record.header_from = header_from;
        }
    }

    if let Some(auth) = access.child(element, "auth_results") {
        let result = |name: &str| {
            access.child(auth, name).map(|block| AuthResult {
                domain: access.child_text(block, "domain"),
                result: access.child_text(block, "result"),
            })
        };
        record.auth_results = Some(AuthResults {
            dkim: result("dkim"),
            spf: result("spf"),
        });
    }

    Ok(record)
}

fn decode_row(access: &Accessor, row: &Element) -> Result<Row> {
    let mut decoded = Row::default();
    if let Some(source_ip) = access.child_text(row, "source_ip") {
        decoded.source_ip = source_ip;
    }
    if let Some(count) = access.child_text(row, "count") {
        decoded.count = count
            .trim()
            .parse()
            .map_err(|_| DmarcError::Parse(format!("invalid record count '{}'", count)))?;
    }
    if let Some(evaluated) = access.child(row, "policy_evaluated") {
        decoded.disposition = access.child_text(evaluated, "disposition");
        decoded.dkim_result = access.child_text(evaluated, "dkim");
        decoded.spf_result = access.child_text(evaluated, "spf");
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feedback>
  <report_metadata>
    <org_name>google.com</org_name>
    <email>noreply-dmarc-support@google.com</email>
    <extra_contact_info>https://support.google.com/a/answer/2466580</extra_contact_info>
    <report_id>4420908763423711</report_id>
    <date_range>
      <begin>1700006400</begin>
      <end>1700092799</end>
    </date_range>
  </report_metadata>
  <policy_published>
    <domain>example.com</domain>
    <adkim>s</adkim>
    <aspf>r</aspf>
    <p>quarantine</p>
    <sp>reject</sp>
    <pct>50</pct>
  </policy_published>
  <record>
    <row>
      <source_ip>203.0.113.7</source_ip>
      <count>10</count>
      <policy_evaluated>
        <disposition>none</disposition>
        <dkim>pass</dkim>
        <spf>pass</spf>
      </policy_evaluated>
    </row>
    <identifiers>
      <header_from>example.com</header_from>
    </identifiers>
    <auth_results>
      <dkim>
        <domain>example.com</domain>
        <selector>google</selector>
        <result>pass</result>
      </dkim>
      <spf>
        <domain>example.com</domain>
        <result>pass</result>
      </spf>
    </auth_results>
  </record>
  <record>
    <row>
      <source_ip>198.51.100.23</source_ip>
      <count>2</count>
      <policy_evaluated>
        <disposition>reject</disposition>
        <dkim>fail</dkim>
        <spf>fail</spf>
      </policy_evaluated>
    </row>
    <identifiers>
      <header_from>example.com</header_from>
    </identifiers>
    <auth_results>
      <spf>
        <domain>spoofer.example</domain>
        <result>softfail</result>
      </spf>
    </auth_results>
  </record>
</feedback>"#;

    #[test]
    fn test_parses_plain_report() {
        let report = parse_dmarc_xml(PLAIN_REPORT);
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report.report_metadata.org_name, "google.com");
        assert_eq!(report.report_metadata.report_id, "4420908763423711");
        assert_eq!(report.report_metadata.date_range.begin, 1700006400);
        assert_eq!(report.report_metadata.date_range.end, 1700092799);
        assert_eq!(report.policy_published.domain, "example.com");
        assert_eq!(report.policy_published.adkim, "s");
        assert_eq!(report.policy_published.p, "quarantine");
        assert_eq!(report.policy_published.sp, "reject");
        assert_eq!(report.policy_published.pct, 50);
        assert_eq!(report.records.len(), 2);

        let first = &report.records[0];
        assert_eq!(first.row.source_ip, "203.0.113.7");
        assert_eq!(first.row.count, 10);
        assert_eq!(first.header_from, "example.com");
        let auth = first.auth_results.as_ref().unwrap();
        assert_eq!(auth.dkim.as_ref().unwrap().result.as_deref(), Some("pass"));

        let second = &report.records[1];
        let auth = second.auth_results.as_ref().unwrap();
        assert!(auth.dkim.is_none());
        assert_eq!(auth.spf.as_ref().unwrap().domain.as_deref(), Some("spoofer.example"));

        assert_eq!(
            report.summary,
            ReportSummary {
                total_records: 2,
                spf_pass: 10,
                spf_fail: 2,
                dkim_pass: 10,
                dkim_fail: 2,
                dmarc_pass: 10,
                dmarc_fail: 2,
                disposition_pass: 10,
                disposition_fail: 2,
            }
        );
    }

    #[test]
    fn test_namespaced_report_matches_plain() {
        let namespaced = PLAIN_REPORT.replace(
            "<feedback>",
            r#"<feedback xmlns="urn:ietf:params:xml:ns:dmarc-2.0">"#,
        );
        let plain = parse_dmarc_xml(PLAIN_REPORT);
        let report = parse_dmarc_xml(&namespaced);
        assert!(report.error.is_none(), "{:?}", report.error);
        assert_eq!(report, plain);
    }

    #[test]
    fn test_prefixed_namespace() {
        let xml = r#"<d:feedback xmlns:d="urn:ietf:params:xml:ns:dmarc-2.0">
            <d:policy_published><d:domain>prefixed.example</d:domain></d:policy_published>
            <d:record><d:row><d:count>4</d:count></d:row></d:record>
        </d:feedback>"#;
        let report = parse_dmarc_xml(xml);
        assert!(report.error.is_none());
        assert_eq!(report.policy_published.domain, "prefixed.example");
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].row.count, 4);
    }

    #[test]
    fn test_namespaced_accessor_ignores_foreign_elements() {
        let xml = r#"<feedback xmlns="urn:dmarc">
            <policy_published><domain xmlns="urn:other">foreign.example</domain></policy_published>
        </feedback>"#;
        let report = parse_dmarc_xml(xml);
        assert!(report.error.is_none());
        assert_eq!(report.policy_published.domain, "Unknown");
    }

    #[test]
    fn test_defaults_for_missing_elements() {
        let xml = r#"<feedback>
            <report_metadata><date_range><begin>soon</begin></date_range></report_metadata>
            <record><row><policy_evaluated><spf>pass</spf></policy_evaluated></row></record>
        </feedback>"#;
        let report = parse_dmarc_xml(xml);
        assert!(report.error.is_none());
        assert_eq!(report.report_metadata.org_name, "Unknown");
        assert_eq!(report.report_metadata.extra_contact_info, "Unknown");
        assert_eq!(report.report_metadata.date_range, DateRange { begin: 0, end: 0 });
        assert_eq!(report.policy_published, PolicyPublished::default());

        let record = &report.records[0];
        assert_eq!(record.row.source_ip, "Unknown");
        assert_eq!(record.row.count, 0);
        assert_eq!(record.row.disposition(), "none");
        assert_eq!(record.row.dkim_result(), "none");
        assert_eq!(record.row.spf_result.as_deref(), Some("pass"));
        assert_eq!(record.header_from, "Unknown");
        assert!(record.auth_results.is_none());
    }

    #[test]
    fn test_invalid_count_keeps_earlier_records() {
        let xml = r#"<feedback>
            <record><row><count>7</count><policy_evaluated><spf>pass</spf></policy_evaluated></row></record>
            <record><row><count>many</count></row></record>
        </feedback>"#;
        let report = parse_dmarc_xml(xml);
        assert!(report.error.as_deref().unwrap().contains("invalid record count"));
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.summary.spf_pass, 7);
    }

    #[test]
    fn test_huge_counts_set_error_instead_of_wrapping() {
        let xml = r#"<feedback>
            <record><row><count>18446744073709551615</count><policy_evaluated><spf>pass</spf></policy_evaluated></row></record>
            <record><row><count>18446744073709551615</count><policy_evaluated><spf>pass</spf></policy_evaluated></row></record>
        </feedback>"#;
        let report = parse_dmarc_xml(xml);
        assert_eq!(report.records.len(), 2);
        let error = report.error.expect("overflow should be reported");
        assert!(error.contains("overflow"), "Unexpected error: {}", error);
        assert_eq!(report.summary, ReportSummary::default());
    }

    #[test]
    fn test_malformed_document_sets_error() {
        let report = parse_dmarc_xml("<feedback><record></feedback>");
        assert!(report.error.is_some());
        assert!(report.records.is_empty());

        let report = parse_dmarc_xml("");
        assert!(report.error.is_some());
    }

    #[test]
    fn test_depth_limit() {
        let xml = format!("{}{}", "<a>".repeat(MAX_DEPTH + 1), "</a>".repeat(MAX_DEPTH + 1));
        let report = parse_dmarc_xml(&xml);
        assert!(report.error.as_deref().unwrap().contains("depth"));
    }

    #[test]
    fn test_parse_missing_file() {
        let report = parse_report_file("/nonexistent/report.xml");
        assert!(report.error.is_some());
    }
}
