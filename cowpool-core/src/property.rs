//vim: tw=80
//! Dataset Properties
use crate::{
    Error,
    Result,
    zio::{ChecksumAlg, Compression, WriteProps}
};
use serde_derive::*;

/// Dataset Properties.
///
/// Properties can be set on individual datasets to affect their behavior in
/// some way.  They all have default values, and most of them are inherited
/// from the parent dataset when unset.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Property {
    /// Access time.
    ///
    /// Recorded for consumers that track access times.  cowpool itself never
    /// updates anything on read.
    Atime(bool),

    /// Checksum algorithm for newly written blocks
    Checksum(ChecksumAlg),

    /// Compression algorithm for newly written blocks
    Compression(Compression),

    /// Number of copies of each data block, from 1 to 3.  Copies go on
    /// distinct top-level vdevs whenever possible.
    Copies(u8),

    /// Maximum space that the dataset's directory may consume, in bytes.  0
    /// means no quota.  Not inherited.
    Quota(u64),

    /// When set, new transactions on the dataset fail with `ReadOnly`
    ReadOnly(bool),

    /// Space guaranteed to the dataset's directory, in bytes.  Not inherited.
    Reservation(u64),

    /// Block size for newly created objects.
    ///
    /// Units are in bytes, log base 2.  So `RecordSize(16)` means 64KB records.
    /// The default is 128KB.
    RecordSize(u8),
}

impl Property {
    pub fn default_value(name: PropertyName) -> Self {
        match name {
            PropertyName::Atime => Property::Atime(true),
            PropertyName::Checksum => Property::Checksum(ChecksumAlg::default()),
            PropertyName::Compression =>
                Property::Compression(Compression::default()),
            PropertyName::Copies => Property::Copies(1),
            PropertyName::Quota => Property::Quota(0),
            PropertyName::ReadOnly => Property::ReadOnly(false),
            PropertyName::Reservation => Property::Reservation(0),
            PropertyName::RecordSize => Property::RecordSize(17), // 128KB
            PropertyName::Invalid => panic!("Invalid props have no values")
        }
    }

    pub fn name(&self) -> PropertyName {
        match self {
            Property::Atime(_) => PropertyName::Atime,
            Property::Checksum(_) => PropertyName::Checksum,
            Property::Compression(_) => PropertyName::Compression,
            Property::Copies(_) => PropertyName::Copies,
            Property::Quota(_) => PropertyName::Quota,
            Property::ReadOnly(_) => PropertyName::ReadOnly,
            Property::Reservation(_) => PropertyName::Reservation,
            Property::RecordSize(_) => PropertyName::RecordSize,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Property::Atime(b) | Property::ReadOnly(b) => *b,
            _ => panic!("{:?} is not a boolean Property", self)
        }
    }

    pub fn as_u64(&self) -> u64 {
        match self {
            Property::Quota(q) => *q,
            Property::Reservation(r) => *r,
            _ => panic!("{:?} is not a u64 Property", self)
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Property::Copies(c) => *c,
            Property::RecordSize(rs) => *rs,
            _ => panic!("{:?} is not a u8 Property", self)
        }
    }
}

impl TryFrom<&str> for Property {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let einval = || Error::InvalidArgument(s.to_string());
        let mut words = s.splitn(2, '=');
        let propname = words.next().ok_or_else(einval)?;
        let propval = words.next();
        let parse_bool = |v: &str| match v {
            "true" | "on" => Ok(true),
            "false" | "off" => Ok(false),
            _ => Err(einval())
        };
        if let Some(v) = propval {
            match propname {
                "atime" => parse_bool(v).map(Property::Atime),
                "checksum" => ChecksumAlg::try_from(v).map(Property::Checksum),
                "compression" =>
                    Compression::try_from(v).map(Property::Compression),
                "copies" => match v.parse::<u8>() {
                    Ok(c @ 1..=3) => Ok(Property::Copies(c)),
                    _ => Err(einval())
                },
                "quota" => v.parse::<u64>()
                    .map(Property::Quota)
                    .map_err(|_| einval()),
                "readonly" => parse_bool(v).map(Property::ReadOnly),
                "reservation" => v.parse::<u64>()
                    .map(Property::Reservation)
                    .map_err(|_| einval()),
                "record_size" => {
                    match v.parse::<usize>() {
                        Ok(rs) if rs.is_power_of_two() &&
                            (4_096..=1_048_576).contains(&rs) =>
                        {
                            Ok(Property::RecordSize(rs.trailing_zeros() as u8))
                        },
                        _ => Err(einval())
                    }
                },
                _ => Err(einval())
            }
        } else {
            // Value may be omitted only for boolean options
            match propname {
                "atime" => Ok(Property::Atime(true)),
                "readonly" => Ok(Property::ReadOnly(true)),
                _ => Err(einval())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd,
         Ord, Serialize)]
pub enum PropertyName {
    Atime,
    Checksum,
    Compression,
    Copies,
    Quota,
    ReadOnly,
    Reservation,
    RecordSize,
    Invalid,    // Must be last!
}

impl PropertyName {
    /// Does a child dataset inherit this property from its parent?
    pub fn inheritable(self) -> bool {
        !matches!(self, PropertyName::Quota | PropertyName::Reservation)
    }

    #[must_use]
    pub fn next(self) -> PropertyName {
        match self {
            PropertyName::Atime => PropertyName::Checksum,
            PropertyName::Checksum => PropertyName::Compression,
            PropertyName::Compression => PropertyName::Copies,
            PropertyName::Copies => PropertyName::Quota,
            PropertyName::Quota => PropertyName::ReadOnly,
            PropertyName::ReadOnly => PropertyName::Reservation,
            PropertyName::Reservation => PropertyName::RecordSize,
            PropertyName::RecordSize => PropertyName::Invalid,
            PropertyName::Invalid => PropertyName::Invalid,
        }
    }
}

/// Where did the property come from?
// The inner value is the number of levels upward from which the property was
// inherited:
// Some(0)  -   Locally set property
// Some(1)  -   Inherited from parent
// Some(2)  -   Inherited from grandparent
// ...
// None     -   Default value
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PropertySource(pub(crate) Option<u8>);
impl PropertySource {
    /// No value has been set for this property on this dataset or any of its
    /// parents.
    pub const DEFAULT: PropertySource = PropertySource(None);
    /// The property's value is inherited from the parent dataset.
    pub const FROM_PARENT: PropertySource = PropertySource(Some(1));
    /// The property's value is inherited from the grandparent dataset.
    pub const FROM_GRANDPARENT: PropertySource = PropertySource(Some(2));
    /// The property was explicitly set on this dataset
    pub const LOCAL: PropertySource = PropertySource(Some(0u8));
}

/// The effective values of every property of one dataset
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EffectiveProps {
    pub atime: bool,
    pub copies: u8,
    pub checksum: ChecksumAlg,
    pub compression: Compression,
    pub quota: u64,
    pub readonly: bool,
    pub record_size: u8,
    pub reservation: u64,
}

impl EffectiveProps {
    /// Resolve every property with `get`, which returns a property's value
    /// and source.
    pub fn resolve<F>(mut get: F) -> Self
        where F: FnMut(PropertyName) -> (Property, PropertySource)
    {
        let mut ep = EffectiveProps {
            atime: true,
            copies: 1,
            checksum: ChecksumAlg::default(),
            compression: Compression::default(),
            quota: 0,
            readonly: false,
            record_size: 17,
            reservation: 0,
        };
        let mut name = PropertyName::Atime;
        while name != PropertyName::Invalid {
            match get(name).0 {
                Property::Atime(b) => ep.atime = b,
                Property::Checksum(c) => ep.checksum = c,
                Property::Compression(c) => ep.compression = c,
                Property::Copies(c) => ep.copies = c,
                Property::Quota(q) => ep.quota = q,
                Property::ReadOnly(b) => ep.readonly = b,
                Property::Reservation(r) => ep.reservation = r,
                Property::RecordSize(rs) => ep.record_size = rs,
            }
            name = name.next();
        }
        ep
    }

    pub fn write_props(&self) -> WriteProps {
        WriteProps {
            compression: self.compression,
            checksum: self.checksum,
            copies: self.copies
        }
    }
}

impl Default for EffectiveProps {
    fn default() -> Self {
        EffectiveProps::resolve(|name| {
            (Property::default_value(name), PropertySource::DEFAULT)
        })
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {

use pretty_assertions::assert_eq;
use rstest::rstest;
use super::*;

#[rstest]
#[case("atime=true", Property::Atime(true))]
#[case("atime=on", Property::Atime(true))]
#[case("atime", Property::Atime(true))]
#[case("atime=false", Property::Atime(false))]
#[case("atime=off", Property::Atime(false))]
#[case("checksum=fletcher4", Property::Checksum(ChecksumAlg::Fletcher4))]
#[case("compression=zstd", Property::Compression(Compression::Zstd))]
#[case("compression=off", Property::Compression(Compression::None))]
#[case("copies=2", Property::Copies(2))]
#[case("quota=1048576", Property::Quota(1_048_576))]
#[case("readonly", Property::ReadOnly(true))]
#[case("reservation=0", Property::Reservation(0))]
#[case("record_size=4096", Property::RecordSize(12))]
#[case("record_size=131072", Property::RecordSize(17))]
#[case("record_size=1048576", Property::RecordSize(20))]
fn property_try_from(#[case] s: &str, #[case] expected: Property) {
    assert_eq!(Ok(expected), Property::try_from(s));
}

#[rstest]
#[case("atime=xyz")]
#[case("copies=0")]
#[case("copies=4")]
#[case("quota")]
#[case("quota=-1")]
#[case("record_size=12")]
#[case("record_size=12288")]
#[case("record_size=true")]
#[case("record_size")]
#[case("mountpoint=/mnt")]
fn property_try_from_invalid(#[case] s: &str) {
    assert!(matches!(Property::try_from(s), Err(Error::InvalidArgument(_))));
}

#[test]
fn every_name_has_a_default() {
    let mut name = PropertyName::Atime;
    while name != PropertyName::Invalid {
        assert_eq!(Property::default_value(name).name(), name);
        name = name.next();
    }
}

#[test]
fn effective_defaults() {
    let ep = EffectiveProps::default();
    assert!(ep.atime);
    assert_eq!(ep.copies, 1);
    assert_eq!(ep.compression, Compression::Lz4);
    assert_eq!(ep.record_size, 17);
    assert_eq!(ep.quota, 0);
    assert_eq!(ep.write_props().copies, 1);
}

#[test]
fn inheritable() {
    assert!(PropertyName::Compression.inheritable());
    assert!(!PropertyName::Quota.inheritable());
    assert!(!PropertyName::Reservation.inheritable());
}

}
// LCOV_EXCL_STOP
