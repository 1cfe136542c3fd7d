/// Access rights of a segment and kind of a single memory access.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read = 0,
    Write = 1,
    ReadWrite = 2,
    Execute = 3,
}

/// Bit `(requested << 2) | granted` is set iff the access is allowed.
const PERMISSION_MATRIX: u16 = 0x8465;

impl AccessType {
    pub(crate) const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => AccessType::Read,
            1 => AccessType::Write,
            2 => AccessType::ReadWrite,
            _ => AccessType::Execute,
        }
    }

    #[inline]
    pub(crate) const fn bits(self) -> u8 {
        self as u8
    }

    /// Whether a segment with rights `self` admits an access of kind `requested`.
    ///
    /// `ReadWrite` rights admit reads and writes but no execution. Everything
    /// else only admits the identical kind.
    #[inline]
    pub fn permits(self, requested: AccessType) -> bool {
        let bit = ((requested.bits() as u16) << 2) | self.bits() as u16;
        PERMISSION_MATRIX & (1 << bit) != 0
    }

    #[inline]
    pub fn writes(self) -> bool {
        matches!(self, AccessType::Write | AccessType::ReadWrite)
    }
}

#[cfg(test)]
mod test {
    use super::AccessType::{self, *};

    #[test]
    fn test_permissions() {
        let all = [Read, Write, ReadWrite, Execute];
        for granted in all {
            for requested in all {
                let expected = granted == requested
                    || (granted == ReadWrite && matches!(requested, Read | Write));
                assert_eq!(
                    granted.permits(requested),
                    expected,
                    "granted {:?} requested {:?}",
                    granted,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_bits() {
        for access in [Read, Write, ReadWrite, Execute] {
            assert_eq!(AccessType::from_bits(access.bits()), access);
        }
    }
}
