//! Device filter rules
//!
//! A filter is an ordered list of rules deciding whether a device may be
//! redirected. Both sides use the same model: the guest can push its policy
//! to the host with `filter_filter`, and the host can reject a device with
//! `filter_reject` before ever advertising it.
//!
//! The text form is `class,vendor,product,bcd,allow` with `-1` as wildcard,
//! rules joined by a second separator class. Both separators are character
//! classes: any contained character separates, runs of separators collapse.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{digit1, hex_digit1, multispace0, oct_digit0, one_of};
use nom::combinator::{all_consuming, map_res, opt, recognize};
use nom::sequence::{preceded, tuple};
use nom::IResult;

/// Wildcard marker for any numeric rule field.
pub const WILDCARD: i32 = -1;

/// A single filter rule.
///
/// Numeric fields are matched exactly unless they hold [`WILDCARD`]. The
/// first rule whose fields all match decides the verdict.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Rule {
    pub device_class: i32,
    pub vendor_id: i32,
    pub product_id: i32,
    pub device_version_bcd: i32,
    pub allow: bool,
}

/// Errors from parsing or serializing rule lists.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FilterError {
    /// A rule is malformed or a field is out of range.
    Invalid,
    /// A separator class is empty.
    InvalidSeparator,
}

/// Outcome of a failed [`check`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Verdict {
    /// A rule explicitly denied the device.
    Denied,
    /// No rule applied and the default policy denies.
    NoMatch,
    /// The rule list itself is invalid.
    Invalid,
}

/// Evaluation policy knobs for [`check`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct CheckFlags {
    /// Allow devices no rule matches (default is to refuse them).
    pub default_allow: bool,
    /// Also judge non-boot HID interface rows, which are normally skipped
    /// on multi-interface devices.
    pub dont_skip_non_boot_hid: bool,
}

/// Range check shared by parse, serialize and check.
pub fn verify(rules: &[Rule]) -> Result<(), FilterError> {
    for rule in rules {
        if rule.device_class < -1 || rule.device_class > 255 {
            return Err(FilterError::Invalid);
        }
        if rule.vendor_id < -1 || rule.vendor_id > 65535 {
            return Err(FilterError::Invalid);
        }
        if rule.product_id < -1 || rule.product_id > 65535 {
            return Err(FilterError::Invalid);
        }
        if rule.device_version_bcd < -1 || rule.device_version_bcd > 65535 {
            return Err(FilterError::Invalid);
        }
    }
    Ok(())
}

/// Recognizes an integer the way a C `strtol(_, _, 0)` would: optional
/// leading whitespace and sign, then hex with an `0x` prefix, octal with a
/// leading `0`, or decimal.
fn integer(input: &str) -> IResult<&str, i64> {
    map_res(
        preceded(
            multispace0,
            recognize(tuple((
                opt(one_of("+-")),
                alt((
                    recognize(preceded(alt((tag("0x"), tag("0X"))), hex_digit1)),
                    recognize(preceded(tag("0"), oct_digit0)),
                    recognize(digit1),
                )),
            ))),
        ),
        |lit: &str| {
            let (neg, lit) = match lit.as_bytes()[0] {
                b'-' => (true, &lit[1..]),
                b'+' => (false, &lit[1..]),
                _ => (false, lit),
            };
            let value = if let Some(hex) = lit.strip_prefix("0x").or_else(|| lit.strip_prefix("0X")) {
                i64::from_str_radix(hex, 16)
            } else if lit.len() > 1 && lit.starts_with('0') {
                i64::from_str_radix(&lit[1..], 8)
            } else {
                lit.parse()
            };
            value.map(|v| if neg { -v } else { v })
        },
    )(input)
}

fn parse_rule(rule: &str, token_sep: &str) -> Result<Rule, FilterError> {
    let mut fields = [0i64; 5];
    let mut count = 0;
    for token in rule
        .split(|c| token_sep.contains(c))
        .filter(|t| !t.is_empty())
    {
        if count == 5 {
            // more than five fields
            return Err(FilterError::Invalid);
        }
        let (_, value) =
            all_consuming(integer)(token).map_err(|_| FilterError::Invalid)?;
        fields[count] = value;
        count += 1;
    }
    if count != 5 {
        return Err(FilterError::Invalid);
    }
    let rule = Rule {
        device_class: fields[0] as i32,
        vendor_id: fields[1] as i32,
        product_id: fields[2] as i32,
        device_version_bcd: fields[3] as i32,
        allow: fields[4] != 0,
    };
    // Reject values a 32-bit field would silently truncate
    if fields[..4].iter().any(|&v| v != (v as i32) as i64) {
        return Err(FilterError::Invalid);
    }
    verify(core::slice::from_ref(&rule))?;
    Ok(rule)
}

/// Parses a filter string into rules.
///
/// Empty rules (leading, trailing or adjacent rule separators) are skipped
/// silently; a malformed rule anywhere fails the whole list.
pub fn parse_rules(
    filter: &str,
    token_sep: &str,
    rule_sep: &str,
) -> Result<Vec<Rule>, FilterError> {
    if token_sep.is_empty() || rule_sep.is_empty() {
        return Err(FilterError::InvalidSeparator);
    }

    let mut rules = Vec::new();
    for rule in filter
        .split(|c| rule_sep.contains(c))
        .filter(|r| !r.is_empty())
    {
        rules.push(parse_rule(rule, token_sep)?);
    }
    Ok(rules)
}

/// Serializes rules back into the text form.
///
/// Uses the first character of each separator class; present values are
/// rendered as zero-padded hex, wildcards as `-1`.
pub fn rules_to_string(
    rules: &[Rule],
    token_sep: &str,
    rule_sep: &str,
) -> Result<String, FilterError> {
    verify(rules)?;
    let ts = token_sep.chars().next().ok_or(FilterError::InvalidSeparator)?;
    let rs = rule_sep.chars().next().ok_or(FilterError::InvalidSeparator)?;

    let mut out = String::new();
    for (i, rule) in rules.iter().enumerate() {
        if i > 0 {
            out.push(rs);
        }
        if rule.device_class != WILDCARD {
            let _ = write!(out, "0x{:02x}", rule.device_class);
        } else {
            out.push_str("-1");
        }
        out.push(ts);
        for field in [rule.vendor_id, rule.product_id, rule.device_version_bcd] {
            if field != WILDCARD {
                let _ = write!(out, "0x{:04x}", field);
            } else {
                out.push_str("-1");
            }
            out.push(ts);
        }
        out.push(if rule.allow { '1' } else { '0' });
    }
    Ok(out)
}

fn check_one(
    rules: &[Rule],
    device_class: u8,
    vendor_id: u16,
    product_id: u16,
    device_version_bcd: u16,
    default_allow: bool,
) -> Result<(), Verdict> {
    for rule in rules {
        if (rule.device_class == WILDCARD || rule.device_class == device_class as i32)
            && (rule.vendor_id == WILDCARD || rule.vendor_id == vendor_id as i32)
            && (rule.product_id == WILDCARD || rule.product_id == product_id as i32)
            && (rule.device_version_bcd == WILDCARD
                || rule.device_version_bcd == device_version_bcd as i32)
        {
            return if rule.allow { Ok(()) } else { Err(Verdict::Denied) };
        }
    }
    if default_allow {
        Ok(())
    } else {
        Err(Verdict::NoMatch)
    }
}

/// Evaluates a device against a rule list.
///
/// The device row is judged unless the device class defers to its
/// interfaces (0x00 composite or 0xEF misc), then each interface row is
/// judged. Non-boot HID interfaces (class 3, subclass 0, protocol 0) of
/// multi-interface devices are skipped so a keyboard row on a webcam does
/// not veto the whole device; if that skips every interface, the check is
/// redone once with skipping disabled so the device is still judged.
pub fn check(
    rules: &[Rule],
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    interfaces: &[(u8, u8, u8)],
    vendor_id: u16,
    product_id: u16,
    device_version_bcd: u16,
    flags: CheckFlags,
) -> Result<(), Verdict> {
    if verify(rules).is_err() {
        return Err(Verdict::Invalid);
    }

    if device_class != 0x00 && device_class != 0xef {
        check_one(
            rules,
            device_class,
            vendor_id,
            product_id,
            device_version_bcd,
            flags.default_allow,
        )?;
    }

    let mut num_skipped = 0;
    for &(class, subclass, protocol) in interfaces {
        if !flags.dont_skip_non_boot_hid
            && interfaces.len() > 1
            && class == 0x03
            && subclass == 0x00
            && protocol == 0x00
        {
            num_skipped += 1;
            continue;
        }
        check_one(
            rules,
            class,
            vendor_id,
            product_id,
            device_version_bcd,
            flags.default_allow,
        )?;
    }

    if !interfaces.is_empty() && num_skipped == interfaces.len() {
        return check(
            rules,
            device_class,
            device_subclass,
            device_protocol,
            interfaces,
            vendor_id,
            product_id,
            device_version_bcd,
            CheckFlags {
                dont_skip_non_boot_hid: true,
                ..flags
            },
        );
    }

    Ok(())
}

/// Evaluates a device described by backend info structures.
///
/// Convenience for embedders deciding whether to redirect a device at all;
/// an unconfigured device is judged on its device row alone.
pub fn check_device(
    rules: &[Rule],
    device: &crate::backend::DeviceInfo,
    config: Option<&crate::backend::ConfigInfo>,
    flags: CheckFlags,
) -> Result<(), Verdict> {
    let mut interfaces: Vec<(u8, u8, u8)> = Vec::new();
    if let Some(config) = config {
        for intf in &config.interfaces {
            interfaces.push((intf.class, intf.subclass, intf.protocol));
        }
    }
    check(
        rules,
        device.device_class,
        device.device_subclass,
        device.device_protocol,
        &interfaces,
        device.vendor_id,
        device.product_id,
        device.device_version_bcd,
        flags,
    )
}
