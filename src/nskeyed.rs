//! Keyed-archive codec for the object graphs DTX payloads carry.
//!
//! The wire format is a binary property list shaped for NSKeyedArchiver:
//! `$objects` is a flat pool, `$top.root` points at the root node, and
//! composite nodes reference their children through UIDs into the pool.
//! Only the classes the instruments and XCTest services actually emit are
//! decoded; anything else raises rather than guessing.

use std::collections::HashMap;

use plist::{Dictionary, Uid, Value};
use uuid::Uuid;

use crate::DeviceError;

const ARCHIVER: &str = "NSKeyedArchiver";
const VERSION: u64 = 100000;

/// Classes that appear in tap streams but carry nothing we consume.
const IGNORED_CLASSES: [&str; 5] = [
    "DTSysmonTapMessage",
    "DTTapHeartbeatMessage",
    "DTTapStatusMessage",
    "XCTAttachment",
    "XCTCapabilities",
];

/// A decoded archive node.
#[derive(Debug, Clone, PartialEq)]
pub enum NsValue {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    String(String),
    Data(Vec<u8>),
    /// Seconds since 2001-01-01T00:00:00Z.
    Date(f64),
    Uuid(Uuid),
    Url {
        base: Option<String>,
        relative: Option<String>,
    },
    Array(Vec<NsValue>),
    Set(Vec<NsValue>),
    Dictionary(HashMap<String, NsValue>),
    Error {
        code: i64,
        domain: String,
        user_info: Box<NsValue>,
    },
    Exception {
        name: String,
        reason: String,
        user_info: Box<NsValue>,
    },
    ActivityRecord(Box<ActivityRecord>),
    /// The inner property list of a `DTActivityTraceTapMessage`, kept raw.
    TapMessage(Box<NsValue>),
    TestConfig(XcTestConfiguration),
    /// A class from the allow-list that decodes to nothing useful.
    Ignored,
}

/// The fixed six-field record XCTest activity reporting uses.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub activity_type: NsValue,
    pub attachments: NsValue,
    pub finish: NsValue,
    pub start: NsValue,
    pub title: NsValue,
    pub uuid: NsValue,
}

impl NsValue {
    pub fn url(base: Option<&str>, relative: &str) -> Self {
        Self::Url {
            base: base.map(str::to_string),
            relative: Some(relative.to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&HashMap<String, NsValue>> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[NsValue]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<&str> for NsValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for NsValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for NsValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for NsValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Uuid> for NsValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Vec<NsValue>> for NsValue {
    fn from(value: Vec<NsValue>) -> Self {
        Self::Array(value)
    }
}

impl From<HashMap<String, NsValue>> for NsValue {
    fn from(value: HashMap<String, NsValue>) -> Self {
        Self::Dictionary(value)
    }
}

/// Serializes a value into archive bytes (binary property list).
pub fn encode(value: &NsValue) -> Result<Vec<u8>, DeviceError> {
    let mut objects: Vec<Value> = vec![Value::String("$null".to_string())];
    let root = encode_value(&mut objects, value)?;

    let mut top = Dictionary::new();
    top.insert("root".into(), Value::Uid(root));

    let mut archive = Dictionary::new();
    archive.insert("$version".into(), (VERSION as i64).into());
    archive.insert("$archiver".into(), ARCHIVER.into());
    archive.insert("$top".into(), Value::Dictionary(top));
    archive.insert("$objects".into(), Value::Array(objects));

    let mut buf = Vec::new();
    Value::Dictionary(archive).to_writer_binary(&mut buf)?;
    Ok(buf)
}

/// Parses archive bytes back into a value graph.
pub fn decode(bytes: &[u8]) -> Result<NsValue, DeviceError> {
    let value: Value = plist::from_bytes(bytes)?;
    let archive = value
        .as_dictionary()
        .ok_or_else(|| DeviceError::DtxDecode("archive is not a dictionary".into()))?;

    match archive.get("$archiver").and_then(|x| x.as_string()) {
        Some(ARCHIVER) => {}
        other => {
            return Err(DeviceError::DtxDecode(format!(
                "unexpected archiver {other:?}"
            )))
        }
    }
    if archive.get("$version").and_then(|x| x.as_unsigned_integer()) != Some(VERSION) {
        return Err(DeviceError::DtxDecode("unexpected archive version".into()));
    }

    let objects = match archive.get("$objects") {
        Some(Value::Array(a)) => a.as_slice(),
        _ => return Err(DeviceError::DtxDecode("archive has no object pool".into())),
    };
    let root = archive
        .get("$top")
        .and_then(|x| x.as_dictionary())
        .and_then(|x| x.get("root"))
        .and_then(|x| match x {
            Value::Uid(u) => Some(u.get()),
            _ => None,
        })
        .ok_or_else(|| DeviceError::DtxDecode("archive has no root".into()))?;

    parse_object(objects, root)
}

fn parse_object(objects: &[Value], index: u64) -> Result<NsValue, DeviceError> {
    if index == 0 {
        return Ok(NsValue::Null);
    }
    let obj = objects
        .get(index as usize)
        .ok_or_else(|| DeviceError::DtxDecode(format!("dangling uid {index}")))?;

    match obj {
        Value::String(s) => Ok(NsValue::String(s.clone())),
        Value::Boolean(b) => Ok(NsValue::Bool(*b)),
        Value::Integer(i) => Ok(NsValue::Int(integer_to_i64(*i)?)),
        Value::Real(r) => Ok(NsValue::Real(*r)),
        Value::Data(d) => Ok(NsValue::Data(d.clone())),
        Value::Dictionary(info) => parse_classed(objects, info),
        other => Err(DeviceError::DtxDecode(format!(
            "unexpected pool entry {other:?}"
        ))),
    }
}

/// Resolves a field that may be stored inline or as a UID reference.
fn resolve(objects: &[Value], value: &Value) -> Result<NsValue, DeviceError> {
    match value {
        Value::Uid(u) => parse_object(objects, u.get()),
        Value::String(s) => Ok(NsValue::String(s.clone())),
        Value::Boolean(b) => Ok(NsValue::Bool(*b)),
        Value::Integer(i) => Ok(NsValue::Int(integer_to_i64(*i)?)),
        Value::Real(r) => Ok(NsValue::Real(*r)),
        Value::Data(d) => Ok(NsValue::Data(d.clone())),
        other => Err(DeviceError::DtxDecode(format!(
            "unresolvable field {other:?}"
        ))),
    }
}

fn integer_to_i64(i: plist::Integer) -> Result<i64, DeviceError> {
    i.as_signed()
        .or_else(|| i.as_unsigned().map(|u| u as i64))
        .ok_or_else(|| DeviceError::DtxDecode("integer out of range".into()))
}

fn class_name<'a>(objects: &'a [Value], info: &Dictionary) -> Result<&'a str, DeviceError> {
    let class_uid = match info.get("$class") {
        Some(Value::Uid(u)) => u.get(),
        _ => return Err(DeviceError::DtxDecode("object without $class".into())),
    };
    objects
        .get(class_uid as usize)
        .and_then(|x| x.as_dictionary())
        .and_then(|x| x.get("$classname"))
        .and_then(|x| x.as_string())
        .ok_or_else(|| DeviceError::DtxDecode("malformed class entry".into()))
}

fn uid_list(info: &Dictionary, key: &str) -> Result<Vec<u64>, DeviceError> {
    match info.get(key) {
        Some(Value::Array(a)) => a
            .iter()
            .map(|x| match x {
                Value::Uid(u) => Ok(u.get()),
                _ => Err(DeviceError::DtxDecode(format!("{key} holds a non-uid"))),
            })
            .collect(),
        _ => Err(DeviceError::DtxDecode(format!("object without {key}"))),
    }
}

fn field<'a>(info: &'a Dictionary, key: &str) -> Result<&'a Value, DeviceError> {
    info.get(key)
        .ok_or_else(|| DeviceError::DtxDecode(format!("object without {key}")))
}

fn parse_classed(objects: &[Value], info: &Dictionary) -> Result<NsValue, DeviceError> {
    let name = class_name(objects, info)?;

    match name {
        "NSDictionary" | "NSMutableDictionary" => {
            let keys = uid_list(info, "NS.keys")?;
            let values = uid_list(info, "NS.objects")?;
            if keys.len() != values.len() {
                return Err(DeviceError::DtxDecode("dictionary key/value mismatch".into()));
            }
            let mut out = HashMap::with_capacity(keys.len());
            for (k, v) in keys.into_iter().zip(values) {
                let key = match parse_object(objects, k)? {
                    NsValue::String(s) => s,
                    other => {
                        return Err(DeviceError::DtxDecode(format!(
                            "non-string dictionary key {other:?}"
                        )))
                    }
                };
                out.insert(key, parse_object(objects, v)?);
            }
            Ok(NsValue::Dictionary(out))
        }
        "NSArray" | "NSMutableArray" => Ok(NsValue::Array(
            uid_list(info, "NS.objects")?
                .into_iter()
                .map(|u| parse_object(objects, u))
                .collect::<Result<_, _>>()?,
        )),
        "NSSet" | "NSMutableSet" => Ok(NsValue::Set(
            uid_list(info, "NS.objects")?
                .into_iter()
                .map(|u| parse_object(objects, u))
                .collect::<Result<_, _>>()?,
        )),
        "NSDate" => match field(info, "NS.time")? {
            Value::Real(t) => Ok(NsValue::Date(*t)),
            Value::Integer(i) => Ok(NsValue::Date(integer_to_i64(*i)? as f64)),
            _ => Err(DeviceError::DtxDecode("NSDate without NS.time".into())),
        },
        "NSUUID" => match field(info, "NS.uuidbytes")? {
            Value::Data(d) => Uuid::from_slice(d)
                .map(NsValue::Uuid)
                .map_err(|_| DeviceError::DtxDecode("NSUUID bytes are not 16 long".into())),
            _ => Err(DeviceError::DtxDecode("NSUUID without bytes".into())),
        },
        "NSURL" => {
            let part = |key: &str| -> Result<Option<String>, DeviceError> {
                match resolve(objects, field(info, key)?)? {
                    NsValue::Null => Ok(None),
                    NsValue::String(s) => Ok(Some(s)),
                    other => Err(DeviceError::DtxDecode(format!(
                        "NSURL {key} is {other:?}"
                    ))),
                }
            };
            Ok(NsValue::Url {
                base: part("NS.base")?,
                relative: part("NS.relative")?,
            })
        }
        "NSNull" => Ok(NsValue::Null),
        "NSString" | "NSMutableString" => match resolve(objects, field(info, "NS.string")?)? {
            NsValue::String(s) => Ok(NsValue::String(s)),
            _ => Err(DeviceError::DtxDecode("NSString without string".into())),
        },
        "NSError" => {
            let code = match resolve(objects, field(info, "NSCode")?)? {
                NsValue::Int(i) => i,
                _ => return Err(DeviceError::DtxDecode("NSError code is not an int".into())),
            };
            let domain = match resolve(objects, field(info, "NSDomain")?)? {
                NsValue::String(s) => s,
                _ => return Err(DeviceError::DtxDecode("NSError domain is not a string".into())),
            };
            let user_info = resolve(objects, field(info, "NSUserInfo")?)?;
            Ok(NsValue::Error {
                code,
                domain,
                user_info: Box::new(user_info),
            })
        }
        "NSException" => {
            let text = |key: &str| -> Result<String, DeviceError> {
                match resolve(objects, field(info, key)?)? {
                    NsValue::String(s) => Ok(s),
                    NsValue::Null => Ok(String::new()),
                    other => Err(DeviceError::DtxDecode(format!(
                        "NSException {key} is {other:?}"
                    ))),
                }
            };
            let user_info = match info.get("NS.userinfo") {
                Some(v) => resolve(objects, v)?,
                None => NsValue::Null,
            };
            Ok(NsValue::Exception {
                name: text("NS.name")?,
                reason: text("NS.reason")?,
                user_info: Box::new(user_info),
            })
        }
        "XCActivityRecord" => {
            let get = |key: &str| resolve(objects, field(info, key)?);
            Ok(NsValue::ActivityRecord(Box::new(ActivityRecord {
                activity_type: get("activityType")?,
                attachments: get("attachments")?,
                finish: get("finish")?,
                start: get("start")?,
                title: get("title")?,
                uuid: get("uuid")?,
            })))
        }
        "DTActivityTraceTapMessage" => {
            let inner = resolve(objects, field(info, "DTTapMessagePlist")?)?;
            Ok(NsValue::TapMessage(Box::new(inner)))
        }
        "XCTestConfiguration" => {
            let mut values = HashMap::new();
            for (key, value) in info.iter() {
                if key == "$class" {
                    continue;
                }
                values.insert(key.to_string(), resolve(objects, value)?);
            }
            Ok(NsValue::TestConfig(XcTestConfiguration { values }))
        }
        other if IGNORED_CLASSES.contains(&other) => Ok(NsValue::Ignored),
        other => Err(DeviceError::UnsupportedArchiveClass(other.to_string())),
    }
}

fn push_class(objects: &mut Vec<Value>, name: &str, classes: &[&str]) -> Uid {
    let uid = Uid::new(objects.len() as u64);
    let mut entry = Dictionary::new();
    entry.insert(
        "$classes".into(),
        Value::Array(classes.iter().map(|c| Value::String(c.to_string())).collect()),
    );
    entry.insert("$classname".into(), name.into());
    objects.push(Value::Dictionary(entry));
    uid
}

fn encode_value(objects: &mut Vec<Value>, value: &NsValue) -> Result<Uid, DeviceError> {
    match value {
        NsValue::Null => Ok(Uid::new(0)),
        NsValue::Bool(b) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Boolean(*b));
            Ok(uid)
        }
        NsValue::Int(i) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push((*i).into());
            Ok(uid)
        }
        NsValue::Real(r) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Real(*r));
            Ok(uid)
        }
        NsValue::String(s) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(s.clone().into());
            Ok(uid)
        }
        NsValue::Data(d) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Data(d.clone()));
            Ok(uid)
        }
        NsValue::Date(t) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Dictionary(Dictionary::new()));
            let class = push_class(objects, "NSDate", &["NSDate", "NSObject"]);
            let mut info = Dictionary::new();
            info.insert("NS.time".into(), Value::Real(*t));
            info.insert("$class".into(), Value::Uid(class));
            objects[uid.get() as usize] = Value::Dictionary(info);
            Ok(uid)
        }
        NsValue::Uuid(u) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Dictionary(Dictionary::new()));
            let class = push_class(objects, "NSUUID", &["NSUUID", "NSObject"]);
            let mut info = Dictionary::new();
            info.insert("NS.uuidbytes".into(), Value::Data(u.as_bytes().to_vec()));
            info.insert("$class".into(), Value::Uid(class));
            objects[uid.get() as usize] = Value::Dictionary(info);
            Ok(uid)
        }
        NsValue::Url { base, relative } => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Dictionary(Dictionary::new()));
            let base_uid = match base {
                Some(s) => encode_value(objects, &NsValue::String(s.clone()))?,
                None => Uid::new(0),
            };
            let relative_uid = match relative {
                Some(s) => encode_value(objects, &NsValue::String(s.clone()))?,
                None => Uid::new(0),
            };
            let class = push_class(objects, "NSURL", &["NSURL", "NSObject"]);
            let mut info = Dictionary::new();
            info.insert("NS.base".into(), Value::Uid(base_uid));
            info.insert("NS.relative".into(), Value::Uid(relative_uid));
            info.insert("$class".into(), Value::Uid(class));
            objects[uid.get() as usize] = Value::Dictionary(info);
            Ok(uid)
        }
        NsValue::Array(items) | NsValue::Set(items) => {
            let (name, classes): (&str, &[&str]) = match value {
                NsValue::Set(_) => ("NSSet", &["NSSet", "NSObject"]),
                _ => ("NSArray", &["NSArray", "NSObject"]),
            };
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Dictionary(Dictionary::new()));
            let mut members = Vec::with_capacity(items.len());
            for item in items {
                members.push(Value::Uid(encode_value(objects, item)?));
            }
            let class = push_class(objects, name, classes);
            let mut info = Dictionary::new();
            info.insert("NS.objects".into(), Value::Array(members));
            info.insert("$class".into(), Value::Uid(class));
            objects[uid.get() as usize] = Value::Dictionary(info);
            Ok(uid)
        }
        NsValue::Dictionary(map) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Dictionary(Dictionary::new()));
            let mut keys = Vec::with_capacity(map.len());
            let mut members = Vec::with_capacity(map.len());
            for (k, v) in map {
                keys.push(Value::Uid(Uid::new(objects.len() as u64)));
                objects.push(k.clone().into());
                members.push(Value::Uid(encode_value(objects, v)?));
            }
            let class = push_class(objects, "NSDictionary", &["NSDictionary", "NSObject"]);
            let mut info = Dictionary::new();
            info.insert("NS.keys".into(), Value::Array(keys));
            info.insert("NS.objects".into(), Value::Array(members));
            info.insert("$class".into(), Value::Uid(class));
            objects[uid.get() as usize] = Value::Dictionary(info);
            Ok(uid)
        }
        NsValue::TestConfig(config) => {
            let uid = Uid::new(objects.len() as u64);
            objects.push(Value::Dictionary(Dictionary::new()));
            let class = push_class(
                objects,
                "XCTestConfiguration",
                &["XCTestConfiguration", "NSObject"],
            );
            let mut info = Dictionary::new();
            info.insert("$class".into(), Value::Uid(class));
            for (key, value) in &config.values {
                // Booleans and small integers are stored inline, except
                // formatVersion which the runner expects as a reference.
                match value {
                    NsValue::Bool(b) if key != "formatVersion" => {
                        info.insert(key.clone(), Value::Boolean(*b));
                    }
                    NsValue::Int(i) if key != "formatVersion" => {
                        info.insert(key.clone(), (*i).into());
                    }
                    other => {
                        info.insert(key.clone(), Value::Uid(encode_value(objects, other)?));
                    }
                }
            }
            objects[uid.get() as usize] = Value::Dictionary(info);
            Ok(uid)
        }
        NsValue::Error { .. }
        | NsValue::Exception { .. }
        | NsValue::ActivityRecord(_)
        | NsValue::TapMessage(_)
        | NsValue::Ignored => Err(DeviceError::UnsupportedArchiveClass(format!(
            "{value:?} is decode-only"
        ))),
    }
}

/// The dictionary testmanagerd unarchives to configure a test session.
///
/// `new` merges the two mandatory fields over the fixed default table; the
/// defaults are load-bearing on specific iOS versions and must round-trip
/// unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct XcTestConfiguration {
    pub values: HashMap<String, NsValue>,
}

impl XcTestConfiguration {
    pub fn new(test_bundle_url: &str, session_identifier: Uuid) -> Self {
        let mut values = Self::defaults();
        values.insert(
            "testBundleURL".to_string(),
            NsValue::url(None, test_bundle_url),
        );
        values.insert(
            "sessionIdentifier".to_string(),
            NsValue::Uuid(session_identifier),
        );
        Self { values }
    }

    pub fn set(&mut self, key: &str, value: NsValue) {
        self.values.insert(key.to_string(), value);
    }

    fn defaults() -> HashMap<String, NsValue> {
        let mut crash_stats = HashMap::new();
        crash_stats.insert(
            "XCSuiteRecordsKey".to_string(),
            NsValue::Dictionary(HashMap::new()),
        );

        let mut d = HashMap::new();
        d.insert(
            "aggregateStatisticsBeforeCrash".to_string(),
            NsValue::Dictionary(crash_stats),
        );
        d.insert(
            "automationFrameworkPath".to_string(),
            NsValue::from("/Developer/Library/PrivateFrameworks/XCTAutomationSupport.framework"),
        );
        d.insert("baselineFileRelativePath".to_string(), NsValue::Null);
        d.insert("baselineFileURL".to_string(), NsValue::Null);
        d.insert(
            "defaultTestExecutionTimeAllowance".to_string(),
            NsValue::Null,
        );
        d.insert("disablePerformanceMetrics".to_string(), NsValue::Bool(false));
        d.insert("emitOSLogs".to_string(), NsValue::Bool(false));
        d.insert("formatVersion".to_string(), NsValue::Int(2));
        d.insert(
            "gatherLocalizableStringsData".to_string(),
            NsValue::Bool(false),
        );
        d.insert("initializeForUITesting".to_string(), NsValue::Bool(true));
        d.insert(
            "maximumTestExecutionTimeAllowance".to_string(),
            NsValue::Null,
        );
        d.insert(
            "productModuleName".to_string(),
            NsValue::from("WebDriverAgentRunner"),
        );
        d.insert("randomExecutionOrderingSeed".to_string(), NsValue::Null);
        d.insert("reportActivities".to_string(), NsValue::Bool(true));
        d.insert("reportResultsToIDE".to_string(), NsValue::Bool(true));
        d.insert("systemAttachmentLifetime".to_string(), NsValue::Int(2));
        d.insert(
            "targetApplicationArguments".to_string(),
            NsValue::Array(Vec::new()),
        );
        d.insert("targetApplicationBundleID".to_string(), NsValue::Null);
        d.insert("targetApplicationEnvironment".to_string(), NsValue::Null);
        d.insert("targetApplicationPath".to_string(), NsValue::Null);
        d.insert(
            "testApplicationDependencies".to_string(),
            NsValue::Dictionary(HashMap::new()),
        );
        d.insert("testApplicationUserOverrides".to_string(), NsValue::Null);
        d.insert("testBundleRelativePath".to_string(), NsValue::Null);
        d.insert("testExecutionOrdering".to_string(), NsValue::Int(0));
        d.insert("testTimeoutsEnabled".to_string(), NsValue::Bool(false));
        d.insert("testsDrivenByIDE".to_string(), NsValue::Bool(false));
        d.insert("testsMustRunOnMainThread".to_string(), NsValue::Bool(true));
        d.insert("testsToRun".to_string(), NsValue::Null);
        d.insert("testsToSkip".to_string(), NsValue::Null);
        d.insert(
            "treatMissingBaselinesAsFailures".to_string(),
            NsValue::Bool(false),
        );
        d.insert("userAttachmentLifetime".to_string(), NsValue::Int(1));
        d
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: NsValue) {
        let bytes = encode(&value).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(NsValue::from("hello world"));
        round_trip(NsValue::Int(-42));
        round_trip(NsValue::Bool(true));
        round_trip(NsValue::Real(2.5));
        round_trip(NsValue::Data(vec![0, 1, 2, 255]));
        round_trip(NsValue::Null);
        round_trip(NsValue::Uuid(Uuid::from_u128(7)));
        round_trip(NsValue::Date(613636438.841612));
        round_trip(NsValue::url(None, "file://abce"));
    }

    #[test]
    fn composites_round_trip() {
        let mut d = HashMap::new();
        d.insert("hello".to_string(), NsValue::from("world"));
        round_trip(NsValue::Dictionary(d));

        round_trip(NsValue::Array(vec![
            NsValue::Int(1),
            NsValue::Int(2),
            NsValue::Int(3),
        ]));
        round_trip(NsValue::Set(vec![NsValue::Int(1), NsValue::from("two")]));

        let mut inner = HashMap::new();
        inner.insert("level2".to_string(), NsValue::from("hello"));
        inner.insert("uuid".to_string(), NsValue::Uuid(Uuid::from_u128(9)));
        inner.insert(
            "level3".to_string(),
            NsValue::Array(vec![NsValue::Int(1), NsValue::Int(2), NsValue::Int(3)]),
        );
        inner.insert(
            "ns-uuid-null".to_string(),
            NsValue::Array(vec![NsValue::Uuid(Uuid::from_u128(3)), NsValue::Null]),
        );
        let mut outer = HashMap::new();
        outer.insert("hello".to_string(), NsValue::Dictionary(inner));
        outer.insert("none-type".to_string(), NsValue::Null);
        round_trip(NsValue::Dictionary(outer));
    }

    #[test]
    fn test_configuration_preserves_every_default() {
        let session = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let config = XcTestConfiguration::new("file:///A/B.xctest", session);
        let bytes = encode(&NsValue::TestConfig(config.clone())).unwrap();

        let decoded = match decode(&bytes).unwrap() {
            NsValue::TestConfig(c) => c,
            other => panic!("decoded to {other:?}"),
        };
        assert_eq!(decoded.values, config.values);
        assert_eq!(
            decoded.values.get("testBundleURL"),
            Some(&NsValue::url(None, "file:///A/B.xctest"))
        );
        assert_eq!(
            decoded.values.get("sessionIdentifier"),
            Some(&NsValue::Uuid(session))
        );
        assert_eq!(decoded.values.get("formatVersion"), Some(&NsValue::Int(2)));
        assert_eq!(
            decoded.values.get("systemAttachmentLifetime"),
            Some(&NsValue::Int(2))
        );
        assert_eq!(
            decoded.values.get("testsMustRunOnMainThread"),
            Some(&NsValue::Bool(true))
        );
    }

    /// Builds a hand-written archive around one classed object.
    fn manual_archive(objects: Vec<Value>) -> Vec<u8> {
        let mut top = Dictionary::new();
        top.insert("root".into(), Value::Uid(Uid::new(1)));
        let mut archive = Dictionary::new();
        archive.insert("$version".into(), 100000i64.into());
        archive.insert("$archiver".into(), "NSKeyedArchiver".into());
        archive.insert("$top".into(), Value::Dictionary(top));
        archive.insert("$objects".into(), Value::Array(objects));
        let mut buf = Vec::new();
        Value::Dictionary(archive).to_writer_binary(&mut buf).unwrap();
        buf
    }

    fn class_entry(name: &str) -> Value {
        let mut d = Dictionary::new();
        d.insert(
            "$classes".into(),
            Value::Array(vec![name.into(), "NSObject".into()]),
        );
        d.insert("$classname".into(), name.into());
        Value::Dictionary(d)
    }

    #[test]
    fn ns_error_decodes_with_inline_code() {
        let mut err = Dictionary::new();
        err.insert("$class".into(), Value::Uid(Uid::new(4)));
        err.insert("NSCode".into(), 1i64.into());
        err.insert("NSDomain".into(), Value::Uid(Uid::new(2)));
        err.insert("NSUserInfo".into(), Value::Uid(Uid::new(3)));

        let bytes = manual_archive(vec![
            "$null".into(),
            Value::Dictionary(err),
            "DTXMessage".into(),
            "kaboom".into(),
            class_entry("NSError"),
        ]);

        match decode(&bytes).unwrap() {
            NsValue::Error {
                code,
                domain,
                user_info,
            } => {
                assert_eq!(code, 1);
                assert_eq!(domain, "DTXMessage");
                assert_eq!(*user_info, NsValue::String("kaboom".to_string()));
            }
            other => panic!("decoded to {other:?}"),
        }
    }

    #[test]
    fn tap_message_exposes_inner_plist() {
        let mut inner = Dictionary::new();
        inner.insert("$class".into(), Value::Uid(Uid::new(5)));
        inner.insert("NS.keys".into(), Value::Array(vec![Value::Uid(Uid::new(3))]));
        inner.insert(
            "NS.objects".into(),
            Value::Array(vec![Value::Uid(Uid::new(4))]),
        );

        let mut tap = Dictionary::new();
        tap.insert("$class".into(), Value::Uid(Uid::new(6)));
        tap.insert("DTTapMessagePlist".into(), Value::Uid(Uid::new(2)));

        let bytes = manual_archive(vec![
            "$null".into(),
            Value::Dictionary(tap),
            Value::Dictionary(inner),
            "k".into(),
            0i64.into(),
            class_entry("NSMutableDictionary"),
            class_entry("DTActivityTraceTapMessage"),
        ]);

        match decode(&bytes).unwrap() {
            NsValue::TapMessage(inner) => {
                let d = inner.as_dictionary().unwrap();
                assert_eq!(d.get("k"), Some(&NsValue::Int(0)));
            }
            other => panic!("decoded to {other:?}"),
        }
    }

    #[test]
    fn unknown_class_is_an_error() {
        let mut obj = Dictionary::new();
        obj.insert("$class".into(), Value::Uid(Uid::new(2)));
        let bytes = manual_archive(vec![
            "$null".into(),
            Value::Dictionary(obj),
            class_entry("DTTotallyNovelMessage"),
        ]);
        match decode(&bytes).unwrap_err() {
            DeviceError::UnsupportedArchiveClass(name) => {
                assert_eq!(name, "DTTotallyNovelMessage")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn allow_listed_classes_decode_to_ignored() {
        let mut obj = Dictionary::new();
        obj.insert("$class".into(), Value::Uid(Uid::new(2)));
        let bytes = manual_archive(vec![
            "$null".into(),
            Value::Dictionary(obj),
            class_entry("XCTCapabilities"),
        ]);
        assert_eq!(decode(&bytes).unwrap(), NsValue::Ignored);
    }
}
