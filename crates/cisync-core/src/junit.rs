//! JUnit XML parsing and conversion into the exported test-suite shape.

use std::collections::HashMap;

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TestStatus;

#[derive(Debug, Error)]
pub enum JunitError {
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed attribute: {0}")]
    Attr(#[from] AttrError),
    #[error("unexpected root element <{0}>")]
    UnexpectedRoot(String),
    #[error("document has no testsuites or testsuite element")]
    MissingRoot,
    #[error("document ended inside <{0}>")]
    UnexpectedEof(&'static str),
}

/// Parsed `<testsuites>` document, free-text fields included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuites {
    pub name: Option<String>,
    pub time: Option<f64>,
    pub tests: Option<u64>,
    pub failures: Option<u64>,
    pub errors: Option<u64>,
    pub disabled: Option<u64>,
    pub testsuite: Vec<TestSuite>,
}

impl TestSuites {
    /// Wraps a document whose root is a single `<testsuite>`.
    pub fn from_suite(suite: TestSuite) -> Self {
        Self {
            name: Some(suite.name.clone()),
            time: suite.time,
            tests: suite.tests,
            failures: suite.failures,
            errors: suite.errors,
            disabled: None,
            testsuite: vec![suite],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuite {
    pub name: String,
    pub tests: Option<u64>,
    pub failures: Option<u64>,
    pub errors: Option<u64>,
    pub skipped: Option<u64>,
    pub time: Option<f64>,
    pub timestamp: Option<String>,
    pub hostname: Option<String>,
    pub properties: Vec<Property>,
    pub testcase: Vec<TestCase>,
    pub system_out: Vec<String>,
    pub system_err: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub classname: Option<String>,
    pub time: Option<f64>,
    pub failure: Vec<TestOutcome>,
    pub error: Vec<TestOutcome>,
    pub skipped: Vec<TestOutcome>,
    pub system_out: Vec<String>,
    pub system_err: Vec<String>,
}

/// Body of a `<failure>`, `<error>` or `<skipped>` element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestOutcome {
    pub message: Option<String>,
    pub kind: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTestSuites {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub testsuite: Vec<ReportTestSuite>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTestSuite {
    pub name: String,
    pub tests: u64,
    pub failures: u64,
    pub errors: u64,
    pub skipped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub testcase: Vec<ReportTestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTestCase {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    pub status: TestStatus,
    pub success_count: u8,
}

/// First present of failure, error, skipped decides; none present is a success.
pub fn test_case_status(case: &TestCase) -> TestStatus {
    if !case.failure.is_empty() {
        TestStatus::Failure
    } else if !case.error.is_empty() {
        TestStatus::Error
    } else if !case.skipped.is_empty() {
        TestStatus::Skipped
    } else {
        TestStatus::Success
    }
}

pub fn convert_to_report_test_suites(suites: TestSuites) -> ReportTestSuites {
    let testsuite: Vec<ReportTestSuite> = suites.testsuite.into_iter().map(convert_suite).collect();
    ReportTestSuites {
        name: suites.name,
        time: suites.time,
        tests: suites
            .tests
            .unwrap_or_else(|| testsuite.iter().map(|s| s.tests).sum()),
        failures: suites
            .failures
            .unwrap_or_else(|| testsuite.iter().map(|s| s.failures).sum()),
        errors: suites
            .errors
            .unwrap_or_else(|| testsuite.iter().map(|s| s.errors).sum()),
        testsuite,
    }
}

fn convert_suite(suite: TestSuite) -> ReportTestSuite {
    let testcase: Vec<ReportTestCase> = suite
        .testcase
        .into_iter()
        .map(|case| {
            let status = test_case_status(&case);
            ReportTestCase {
                name: case.name,
                classname: case.classname,
                time: case.time,
                status,
                success_count: u8::from(status == TestStatus::Success),
            }
        })
        .collect();
    let count = |status: TestStatus| testcase.iter().filter(|c| c.status == status).count() as u64;

    ReportTestSuite {
        name: suite.name,
        tests: suite.tests.unwrap_or(testcase.len() as u64),
        failures: suite.failures.unwrap_or_else(|| count(TestStatus::Failure)),
        errors: suite.errors.unwrap_or_else(|| count(TestStatus::Error)),
        skipped: suite.skipped.unwrap_or_else(|| count(TestStatus::Skipped)),
        time: suite.time,
        timestamp: suite.timestamp,
        testcase,
    }
}

/// Parses a JUnit document rooted at `<testsuites>` or at a single `<testsuite>`.
pub fn parse_junit(xml: &str) -> Result<TestSuites, JunitError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    loop {
        let (start, empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::Eof => return Err(JunitError::MissingRoot),
            _ => continue,
        };
        return match start.name().as_ref() {
            b"testsuites" => read_testsuites(&mut reader, &start, empty),
            b"testsuite" => read_testsuite(&mut reader, &start, empty).map(TestSuites::from_suite),
            other => Err(JunitError::UnexpectedRoot(
                String::from_utf8_lossy(other).into_owned(),
            )),
        };
    }
}

fn read_testsuites(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    empty: bool,
) -> Result<TestSuites, JunitError> {
    let attrs = attributes(start)?;
    let mut suites = TestSuites {
        name: attrs.get("name").cloned(),
        time: attr_f64(&attrs, "time"),
        tests: attr_u64(&attrs, "tests"),
        failures: attr_u64(&attrs, "failures"),
        errors: attr_u64(&attrs, "errors"),
        disabled: attr_u64(&attrs, "disabled"),
        testsuite: Vec::new(),
    };
    if empty {
        return Ok(suites);
    }

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == b"testsuite" => {
                suites.testsuite.push(read_testsuite(reader, &e, false)?);
            }
            Event::Empty(e) if e.name().as_ref() == b"testsuite" => {
                suites.testsuite.push(read_testsuite(reader, &e, true)?);
            }
            Event::Start(e) => {
                reader.read_to_end(e.name())?;
            }
            Event::End(_) => return Ok(suites),
            Event::Eof => return Err(JunitError::UnexpectedEof("testsuites")),
            _ => {}
        }
    }
}

fn read_testsuite(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    empty: bool,
) -> Result<TestSuite, JunitError> {
    let attrs = attributes(start)?;
    let mut suite = TestSuite {
        name: attrs.get("name").cloned().unwrap_or_default(),
        tests: attr_u64(&attrs, "tests"),
        failures: attr_u64(&attrs, "failures"),
        errors: attr_u64(&attrs, "errors"),
        skipped: attr_u64(&attrs, "skipped").or_else(|| attr_u64(&attrs, "skips")),
        time: attr_f64(&attrs, "time"),
        timestamp: attrs.get("timestamp").cloned(),
        hostname: attrs.get("hostname").cloned(),
        ..TestSuite::default()
    };
    if empty {
        return Ok(suite);
    }

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.name().as_ref() {
                b"testcase" => suite.testcase.push(read_testcase(reader, &e, false)?),
                b"properties" => suite.properties = read_properties(reader)?,
                b"system-out" => suite.system_out.push(read_text(reader, "system-out")?),
                b"system-err" => suite.system_err.push(read_text(reader, "system-err")?),
                // Nested suites (pytest, some gradle setups) fold into their parent.
                b"testsuite" => {
                    let nested = read_testsuite(reader, &e, false)?;
                    suite.testcase.extend(nested.testcase);
                }
                _ => {
                    reader.read_to_end(e.name())?;
                }
            },
            Event::Empty(e) if e.name().as_ref() == b"testcase" => {
                suite.testcase.push(read_testcase(reader, &e, true)?);
            }
            Event::End(_) => return Ok(suite),
            Event::Eof => return Err(JunitError::UnexpectedEof("testsuite")),
            _ => {}
        }
    }
}

fn read_testcase(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    empty: bool,
) -> Result<TestCase, JunitError> {
    let attrs = attributes(start)?;
    let mut case = TestCase {
        name: attrs.get("name").cloned().unwrap_or_default(),
        classname: attrs.get("classname").cloned(),
        time: attr_f64(&attrs, "time"),
        ..TestCase::default()
    };
    if empty {
        return Ok(case);
    }

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let tag = e.name().as_ref().to_vec();
                match tag.as_slice() {
                    b"failure" => case.failure.push(read_outcome(reader, &e, false)?),
                    b"error" => case.error.push(read_outcome(reader, &e, false)?),
                    b"skipped" => case.skipped.push(read_outcome(reader, &e, false)?),
                    b"system-out" => case.system_out.push(read_text(reader, "system-out")?),
                    b"system-err" => case.system_err.push(read_text(reader, "system-err")?),
                    _ => {
                        reader.read_to_end(e.name())?;
                    }
                }
            }
            Event::Empty(e) => match e.name().as_ref() {
                b"failure" => case.failure.push(read_outcome(reader, &e, true)?),
                b"error" => case.error.push(read_outcome(reader, &e, true)?),
                b"skipped" => case.skipped.push(read_outcome(reader, &e, true)?),
                _ => {}
            },
            Event::End(_) => return Ok(case),
            Event::Eof => return Err(JunitError::UnexpectedEof("testcase")),
            _ => {}
        }
    }
}

fn read_outcome(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
    empty: bool,
) -> Result<TestOutcome, JunitError> {
    let attrs = attributes(start)?;
    let text = if empty {
        String::new()
    } else {
        read_text(reader, "testcase outcome")?
    };
    Ok(TestOutcome {
        message: attrs.get("message").cloned(),
        kind: attrs.get("type").cloned(),
        text,
    })
}

fn read_properties(reader: &mut Reader<&[u8]>) -> Result<Vec<Property>, JunitError> {
    let mut properties = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Empty(e) if e.name().as_ref() == b"property" => {
                properties.push(property(&e)?);
            }
            Event::Start(e) if e.name().as_ref() == b"property" => {
                let mut prop = property(&e)?;
                let text = read_text(reader, "property")?;
                if prop.value.is_empty() {
                    prop.value = text;
                }
                properties.push(prop);
            }
            Event::Start(e) => {
                reader.read_to_end(e.name())?;
            }
            Event::End(_) => return Ok(properties),
            Event::Eof => return Err(JunitError::UnexpectedEof("properties")),
            _ => {}
        }
    }
}

fn property(start: &BytesStart) -> Result<Property, JunitError> {
    let attrs = attributes(start)?;
    Ok(Property {
        name: attrs.get("name").cloned().unwrap_or_default(),
        value: attrs.get("value").cloned().unwrap_or_default(),
    })
}

/// Collects text and CDATA up to the end tag closing the current element.
fn read_text(reader: &mut Reader<&[u8]>, element: &'static str) -> Result<String, JunitError> {
    let mut text = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event()? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::Start(_) => depth += 1,
            Event::End(_) if depth == 0 => return Ok(text),
            Event::End(_) => depth -= 1,
            Event::Eof => return Err(JunitError::UnexpectedEof(element)),
            _ => {}
        }
    }
}

fn attributes(start: &BytesStart) -> Result<HashMap<String, String>, JunitError> {
    let mut out = HashMap::new();
    for attr in start.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        out.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(out)
}

fn attr_f64(attrs: &HashMap<String, String>, key: &str) -> Option<f64> {
    attrs
        .get(key)
        .and_then(|v| v.replace(',', "").trim().parse().ok())
}

fn attr_u64(attrs: &HashMap<String, String>, key: &str) -> Option<u64> {
    attrs.get(key).and_then(|v| v.trim().parse().ok())
}
