use crate::error::BridgeError;
use std::fmt;
use std::str::FromStr;

/// Discriminant of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyType {
    Null = 0,
    String,
    Number,
    Boolean,
    Array,
    Object,
    Callback,
    Variable,
    Function,
    Composite,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::Null => "null",
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Array => "array",
            PropertyType::Object => "object",
            PropertyType::Callback => "callback",
            PropertyType::Variable => "variable",
            PropertyType::Function => "function",
            PropertyType::Composite => "composite",
        };
        f.write_str(name)
    }
}

/// Unit attached to a numeric property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Unit {
    #[default]
    None,
    Px,
    /// Percent, written `%`.
    Pc,
    Vw,
    Vh,
    Pw,
    Ph,
    Cw,
    Ch,
    Deg,
    Rad,
}

impl Unit {
    pub fn suffix(&self) -> &'static str {
        match self {
            Unit::None => "",
            Unit::Px => "px",
            Unit::Pc => "%",
            Unit::Vw => "vw",
            Unit::Vh => "vh",
            Unit::Pw => "pw",
            Unit::Ph => "ph",
            Unit::Cw => "cw",
            Unit::Ch => "ch",
            Unit::Deg => "deg",
            Unit::Rad => "rad",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for Unit {
    type Err = BridgeError;

    fn from_str(suffix: &str) -> Result<Self, Self::Err> {
        match suffix {
            "" => Ok(Unit::None),
            "px" => Ok(Unit::Px),
            "%" | "pc" => Ok(Unit::Pc),
            "vw" => Ok(Unit::Vw),
            "vh" => Ok(Unit::Vh),
            "pw" => Ok(Unit::Pw),
            "ph" => Ok(Unit::Ph),
            "cw" => Ok(Unit::Cw),
            "ch" => Ok(Unit::Ch),
            "deg" => Ok(Unit::Deg),
            "rad" => Ok(Unit::Rad),
            _ => Err(BridgeError::UnknownUnit {
                suffix: suffix.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_suffixes() {
        assert_eq!(Unit::Pc.to_string(), "%");
        assert_eq!(Unit::None.suffix(), "");
        assert_eq!("pc".parse::<Unit>().unwrap(), Unit::Pc);
        assert_eq!("%".parse::<Unit>().unwrap(), Unit::Pc);
        assert_eq!("deg".parse::<Unit>().unwrap(), Unit::Deg);
        assert!("em".parse::<Unit>().is_err());
    }

    #[test]
    fn test_property_type_order() {
        assert_eq!(PropertyType::Null as u8, 0);
        assert_eq!(PropertyType::Composite as u8, 9);
    }
}
