//! Prometheus text exposition format.
//!
//! Parses pushed request bodies into metric families and renders the
//! merged families back out for scraping.

use std::collections::{BTreeMap, HashSet};

use nom::branch::alt;
use nom::bytes::complete::{escaped_transform, is_not, take_while, take_while1};
use nom::character::complete::{char, i64, space0, space1};
use nom::combinator::{cut, eof, map, map_opt, opt, recognize, value};
use nom::error::{context, VerboseError, VerboseErrorKind};
use nom::multi::separated_list1;
use nom::sequence::{delimited, pair, preceded, separated_pair, terminated, tuple};
use nom::IResult;
use thiserror::Error;

use pushgate_store::{
    format_value, is_valid_metric_name, parse_value, MetricFamily, MetricType, Sample,
};

/// Content type of the rendered exposition.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// A malformed push body.
#[derive(Debug, Error, PartialEq)]
#[error("text format parsing error in line {line}: {msg}")]
pub struct ParseError {
    pub line: usize,
    pub msg: String,
}

fn err<T>(line: usize, msg: impl Into<String>) -> Result<T, ParseError> {
    Err(ParseError {
        line,
        msg: msg.into(),
    })
}

// ── Parsing ────────────────────────────────────────────────────────

/// Parse a text-format body into families keyed by name.
pub fn parse_text(input: &str) -> Result<BTreeMap<String, MetricFamily>, ParseError> {
    let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();
    let mut typed: HashSet<String> = HashSet::new();
    let mut seen: HashSet<(String, BTreeMap<String, String>)> = HashSet::new();
    let mut current: Option<String> = None;

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            let mut parts = comment.trim_start().splitn(3, char::is_whitespace);
            let keyword = parts.next().unwrap_or_default();
            if keyword != "HELP" && keyword != "TYPE" {
                continue;
            }
            let Some(name) = parts.next().filter(|n| !n.is_empty()) else {
                return err(line_no, format!("{keyword} line without metric name"));
            };
            if !is_valid_metric_name(name) {
                return err(line_no, format!("invalid metric name {name:?}"));
            }
            let rest = parts.next().unwrap_or_default().trim();
            let family = families
                .entry(name.to_string())
                .or_insert_with(|| MetricFamily::new(name, MetricType::Untyped));

            if keyword == "HELP" {
                if family.help.is_some() {
                    return err(line_no, format!("second HELP line for metric {name:?}"));
                }
                family.help = Some(unescape_help(rest));
            } else {
                if !typed.insert(name.to_string()) {
                    return err(line_no, format!("second TYPE line for metric {name:?}"));
                }
                if !family.samples.is_empty() {
                    return err(line_no, format!("TYPE line for {name:?} after its samples"));
                }
                let Some(metric_type) = MetricType::from_name(rest) else {
                    return err(line_no, format!("unknown metric type {rest:?}"));
                };
                family.metric_type = metric_type;
            }
            current = Some(name.to_string());
            continue;
        }

        let sample = parse_sample(line).or_else(|msg| err(line_no, msg))?;
        if !seen.insert((sample.name.clone(), sample.labels.clone())) {
            return err(
                line_no,
                format!("duplicate sample {:?} with the same labels", sample.name),
            );
        }

        let owner = current
            .as_ref()
            .filter(|c| families[c.as_str()].owns_sample_name(&sample.name))
            .cloned()
            .or_else(|| {
                families
                    .values()
                    .find(|f| f.owns_sample_name(&sample.name))
                    .map(|f| f.name.clone())
            })
            .unwrap_or_else(|| sample.name.clone());

        families
            .entry(owner.clone())
            .or_insert_with(|| MetricFamily::new(owner.as_str(), MetricType::Untyped))
            .samples
            .push(sample);
        current = Some(owner);
    }

    // HELP/TYPE without samples carries nothing to expose.
    families.retain(|_, f| !f.samples.is_empty());
    Ok(families)
}

// Sample lines: `name{label="value",...} value [timestamp_ms]`.

type Res<'a, O> = IResult<&'a str, O, VerboseError<&'a str>>;

fn metric_name(input: &str) -> Res<'_, &str> {
    context(
        "invalid metric name",
        recognize(pair(
            take_while1(|c: char| c.is_ascii_alphabetic() || c == '_' || c == ':'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':'),
        )),
    )(input)
}

fn label_name(input: &str) -> Res<'_, &str> {
    context(
        "invalid label name",
        recognize(pair(
            take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )),
    )(input)
}

/// A double-quoted label value with `\\`, `\"`, and `\n` escapes.
fn label_value(input: &str) -> Res<'_, String> {
    let escapes = alt((
        value("\\", char('\\')),
        value("\"", char('"')),
        value("\n", char('n')),
    ));
    context(
        "invalid label value",
        delimited(
            char('"'),
            map(
                opt(escaped_transform(is_not("\\\""), '\\', escapes)),
                Option::unwrap_or_default,
            ),
            char('"'),
        ),
    )(input)
}

fn label_pair(input: &str) -> Res<'_, (&str, String)> {
    separated_pair(label_name, delimited(space0, char('='), space0), label_value)(input)
}

fn label_set(input: &str) -> Res<'_, Vec<(&str, String)>> {
    preceded(
        pair(char('{'), space0),
        cut(alt((
            map(char('}'), |_| Vec::new()),
            terminated(
                separated_list1(delimited(space0, char(','), space0), label_pair),
                tuple((
                    space0,
                    opt(char(',')),
                    space0,
                    context("expected ',' or '}' in label set", char('}')),
                )),
            ),
        ))),
    )(input)
}

fn sample_value(input: &str) -> Res<'_, f64> {
    context(
        "invalid sample value",
        map_opt(take_while1(|c: char| !c.is_whitespace()), parse_value),
    )(input)
}

type SampleParts<'a> = (&'a str, Option<Vec<(&'a str, String)>>, f64, Option<i64>);

fn sample_line(input: &str) -> Res<'_, SampleParts<'_>> {
    terminated(
        tuple((
            metric_name,
            preceded(space0, opt(label_set)),
            preceded(space0, sample_value),
            opt(preceded(space1, i64)),
        )),
        pair(space0, context("unexpected trailing data", eof)),
    )(input)
}

/// The innermost context attached to a failed parse.
fn describe(line: &str, e: nom::Err<VerboseError<&str>>) -> String {
    let ctx = match e {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            e.errors.iter().find_map(|(_, kind)| match kind {
                VerboseErrorKind::Context(ctx) => Some(*ctx),
                _ => None,
            })
        }
        nom::Err::Incomplete(_) => None,
    };
    format!("{} in {line:?}", ctx.unwrap_or("malformed sample"))
}

fn parse_sample(line: &str) -> Result<Sample, String> {
    let (_, (name, pairs, value, timestamp_ms)) =
        sample_line(line).map_err(|e| describe(line, e))?;

    let mut labels = BTreeMap::new();
    for (label, label_value) in pairs.unwrap_or_default() {
        if labels.insert(label.to_string(), label_value).is_some() {
            return Err(format!("duplicate label {label:?} for metric {name:?}"));
        }
    }

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    })
}

fn unescape_help(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ── Rendering ──────────────────────────────────────────────────────

/// Render families in the text exposition format.
pub fn render_text(families: &[MetricFamily]) -> String {
    let mut out = String::new();

    for family in families {
        if let Some(help) = &family.help {
            out.push_str(&format!("# HELP {} {}\n", family.name, escape_help(help)));
        }
        out.push_str(&format!("# TYPE {} {}\n", family.name, family.metric_type));
        for sample in &family.samples {
            out.push_str(&sample.name);
            if !sample.labels.is_empty() {
                let labels: Vec<String> = sample
                    .labels
                    .iter()
                    .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
                    .collect();
                out.push('{');
                out.push_str(&labels.join(","));
                out.push('}');
            }
            out.push(' ');
            out.push_str(&format_value(sample.value));
            if let Some(ts) = sample.timestamp_ms {
                out.push_str(&format!(" {ts}"));
            }
            out.push('\n');
        }
    }

    out
}

fn escape_help(s: &str) -> String {
    s.replace('\\', r"\\").replace('\n', r"\n")
}

fn escape_label_value(s: &str) -> String {
    s.replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}
