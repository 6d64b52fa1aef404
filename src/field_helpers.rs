//! Builtin field converters and preprocessors
//!
//! Network headers keep multi-byte values in network byte order, and
//! bpftrace grew byte-swapping helpers only over time. These constructors
//! build converters matching the active feature mask: `bswap()` where the
//! host supports it, explicit shift-and-mask statements otherwise.

use std::fmt;
use std::net::IpAddr;
use std::rc::Rc;

use anyhow::bail;
use thiserror::Error;

use crate::features::{CoreFeatures, FeatureFlagMask};
use crate::fields::{ConverterOutput, FieldConverter};
use crate::program::{expr_field, expr_join, Expression, Statement};

/// bpftrace builtin integer types usable in casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
}

impl BuiltinType {
    pub fn as_str(self) -> &'static str {
        match self {
            BuiltinType::Bool => "bool",
            BuiltinType::Int8 => "int8",
            BuiltinType::Int16 => "int16",
            BuiltinType::Int32 => "int32",
            BuiltinType::Int64 => "int64",
            BuiltinType::UInt8 => "uint8",
            BuiltinType::UInt16 => "uint16",
            BuiltinType::UInt32 => "uint32",
            BuiltinType::UInt64 => "uint64",
        }
    }
}

impl fmt::Display for BuiltinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formats an intermediate variable name usable for nested fields.
pub fn format_variable_name(field: &str) -> Expression {
    Expression::new(format!(
        "${}",
        field.replace('.', "_").replace("->", "_")
    ))
}

/// Converter formatting its expression from a pattern; every `{obj}` in the
/// pattern is replaced with the object variable.
pub fn new_object_conv_expr(pattern: &str) -> FieldConverter {
    let pattern = pattern.to_string();
    Rc::new(move |obj, _field| (Vec::new(), Expression::new(pattern.replace("{obj}", obj))))
}

/// Binary-operation converter over two `{obj}` patterns, casting both sides
/// to a builtin type where the host bpftrace supports it.
pub fn new_object_bin_op_conv_expr(
    left: &str,
    right: &str,
    bin_op: &str,
    conv_type: Option<BuiltinType>,
    mask: &FeatureFlagMask,
    features: &CoreFeatures,
) -> FieldConverter {
    let mut left = left.to_string();
    let mut right = right.to_string();
    if let Some(ty) = conv_type {
        if mask.supports(features.builtin_types) {
            left = format!("({ty}){left}");
            right = format!("({ty}){right}");
        }
    }

    new_object_conv_expr(&format!("{left}{bin_op}{right}"))
}

/// Converter extracting a bit field: shifts the value right and masks it.
pub fn new_conv_bitfield_expr(offset: u32, mask: u64) -> FieldConverter {
    Rc::new(move |obj, field| {
        (
            Vec::new(),
            Expression::new(format!(
                "({} >> {offset}) & {mask:#x}",
                expr_field(obj, field)
            )),
        )
    })
}

/// Converter expanding a fixed-size array field into its elements.
pub fn new_array_conv_expr(size: usize) -> FieldConverter {
    Rc::new(move |obj, field| {
        let field_expr = expr_field(obj, field);
        let exprs: Vec<Expression> = (0..size)
            .map(|i| Expression::new(format!("{field_expr}[{i}]")))
            .collect();
        (Vec::new(), expr_join(&exprs))
    })
}

/// Format specification matching [`new_array_conv_expr`] output.
pub fn array_fmt_spec(size: usize, fmt_key: &str) -> String {
    vec![fmt_key; size].join(", ")
}

// Byte order swap in a 16-bit word, spelled out for hosts without bswap().
fn conv_ntohs_impl(obj: &str, field: &str) -> ConverterOutput {
    let var = format_variable_name(field);
    let stmts = vec![
        Statement::text(format!("{var} = {obj}->{field}")),
        Statement::text(format!("{var} = ({var} >> 8) | (({var} & 0xff) << 8)")),
    ];
    (stmts, var)
}

// Byte order swap in a 32-bit word.
fn conv_ntohl_impl(obj: &str, field: &str) -> ConverterOutput {
    let var = format_variable_name(field);
    let stmts = vec![
        Statement::text(format!("{var} = {obj}->{field}")),
        Statement::text(format!(
            "{var} = ({var} >> 24) | \n\
             \x20          (({var} & 0x00ff0000) >> 8) | \n\
             \x20          (({var} & 0x0000ff00) << 8) | \n\
             \x20          (({var} & 0x000000ff) << 24)"
        )),
    ];
    (stmts, var)
}

/// Explicit network-to-host conversion of a 16-bit field.
pub fn conv_ntohs() -> FieldConverter {
    Rc::new(conv_ntohs_impl)
}

/// Explicit network-to-host conversion of a 32-bit field.
pub fn conv_ntohl() -> FieldConverter {
    Rc::new(conv_ntohl_impl)
}

fn conv_bswap(obj: &str, field: &str) -> ConverterOutput {
    (
        Vec::new(),
        Expression::new(format!("bswap({obj}->{field})")),
    )
}

fn conv_bswap16(obj: &str, field: &str) -> ConverterOutput {
    (
        Vec::new(),
        Expression::new(format!("bswap((uint16){obj}->{field})")),
    )
}

fn conv_bswap32(obj: &str, field: &str) -> ConverterOutput {
    (
        Vec::new(),
        Expression::new(format!("bswap((uint32){obj}->{field})")),
    )
}

/// Best byte-swapping converter for the host: `bswap()` with or without a
/// builtin type cast on new bpftrace, explicit swap statements on old ones.
///
/// # Panics
/// Panics on a bit size without a converter; catalogs only register 16- and
/// 32-bit swapped fields.
pub fn new_bswap_conv(
    mask: &FeatureFlagMask,
    features: &CoreFeatures,
    bit_size: u32,
) -> FieldConverter {
    if mask.supports(features.bswap) {
        if mask.supports(features.builtin_types) {
            match bit_size {
                16 => return Rc::new(conv_bswap16),
                32 => return Rc::new(conv_bswap32),
                _ => {}
            }
        } else {
            return Rc::new(conv_bswap);
        }
    } else {
        match bit_size {
            16 => return conv_ntohs(),
            32 => return conv_ntohl(),
            _ => {}
        }
    }

    panic!("bit_size = {bit_size} is not supported by bswap-converters");
}

/// Preprocessor for values compared against ntohs-converted fields: parses
/// a decimal or hex 16-bit literal and re-emits it in network byte order.
pub fn fpp_ntohs(_op: &str, value: &str) -> anyhow::Result<String> {
    let (digits, base) = match value.strip_prefix("0x") {
        Some(rest) => (rest, 16),
        None => (value, 10),
    };
    let host = u16::from_str_radix(digits, base)?;
    let net = u16::from_be_bytes(host.to_ne_bytes());
    Ok(net.to_string())
}

/// Distinct error type for IPv4 literal failures, so front ends can suggest
/// the IPv6 switch when the literal actually parses as IPv6.
#[derive(Debug, Error)]
#[error("invalid IPv4 address '{address}'")]
pub struct InvalidIpv4Address {
    pub address: String,
    pub looks_like_ipv6: bool,
}

/// Preprocessor turning a dotted IPv4 literal into the host-endian integer
/// the kernel stores, formatted as hex.
pub fn fpp_pton_inet(op: &str, value: &str) -> anyhow::Result<String> {
    if op != "==" {
        bail!("IP addresses can be compared only with equals");
    }

    match value.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(format!("{:#x}", u32::from_ne_bytes(ip.octets()))),
        Ok(IpAddr::V6(_)) => Err(InvalidIpv4Address {
            address: value.to_string(),
            looks_like_ipv6: true,
        }
        .into()),
        Err(_) => Err(InvalidIpv4Address {
            address: value.to_string(),
            looks_like_ipv6: false,
        }
        .into()),
    }
}
