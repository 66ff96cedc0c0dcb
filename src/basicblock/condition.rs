//! Branch conditions for basic-block successors.

use std::fmt;

use iced_x86::{Code, ConditionCode};

/// The condition under which a successor is taken.
///
/// Besides `Always` the variants mirror the x86 condition codes. A conditional basic block
/// carries two successors whose conditions are exact inverses of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessorCondition {
    /// Taken unconditionally.
    Always,
    /// Overflow (OF=1).
    Overflow,
    /// Not overflow (OF=0).
    NotOverflow,
    /// Below (CF=1).
    Below,
    /// Above or equal (CF=0).
    AboveOrEqual,
    /// Equal (ZF=1).
    Equal,
    /// Not equal (ZF=0).
    NotEqual,
    /// Below or equal (CF=1 or ZF=1).
    BelowOrEqual,
    /// Above (CF=0 and ZF=0).
    Above,
    /// Sign (SF=1).
    Sign,
    /// Not sign (SF=0).
    NotSign,
    /// Parity even (PF=1).
    Parity,
    /// Parity odd (PF=0).
    NotParity,
    /// Less (SF!=OF).
    Less,
    /// Greater or equal (SF=OF).
    GreaterOrEqual,
    /// Less or equal (ZF=1 or SF!=OF).
    LessOrEqual,
    /// Greater (ZF=0 and SF=OF).
    Greater,
}

impl SuccessorCondition {
    /// Returns the inverse condition, or `None` for `Always`.
    #[must_use]
    pub fn inverse(self) -> Option<Self> {
        use SuccessorCondition::*;
        Some(match self {
            Always => return None,
            Overflow => NotOverflow,
            NotOverflow => Overflow,
            Below => AboveOrEqual,
            AboveOrEqual => Below,
            Equal => NotEqual,
            NotEqual => Equal,
            BelowOrEqual => Above,
            Above => BelowOrEqual,
            Sign => NotSign,
            NotSign => Sign,
            Parity => NotParity,
            NotParity => Parity,
            Less => GreaterOrEqual,
            GreaterOrEqual => Less,
            LessOrEqual => Greater,
            Greater => LessOrEqual,
        })
    }

    /// Maps the decoder's condition code onto a successor condition.
    ///
    /// Returns `None` for [`ConditionCode::None`] (the instruction is not conditional).
    #[must_use]
    pub fn from_condition_code(code: ConditionCode) -> Option<Self> {
        use SuccessorCondition::*;
        Some(match code {
            ConditionCode::None => return None,
            ConditionCode::o => Overflow,
            ConditionCode::no => NotOverflow,
            ConditionCode::b => Below,
            ConditionCode::ae => AboveOrEqual,
            ConditionCode::e => Equal,
            ConditionCode::ne => NotEqual,
            ConditionCode::be => BelowOrEqual,
            ConditionCode::a => Above,
            ConditionCode::s => Sign,
            ConditionCode::ns => NotSign,
            ConditionCode::p => Parity,
            ConditionCode::np => NotParity,
            ConditionCode::l => Less,
            ConditionCode::ge => GreaterOrEqual,
            ConditionCode::le => LessOrEqual,
            ConditionCode::g => Greater,
        })
    }

    /// The branch opcode realizing this condition, in the requested encoding.
    ///
    /// `Always` yields `jmp rel8`/`jmp rel32`; the conditional variants yield the
    /// corresponding `jcc`.
    #[must_use]
    pub fn branch_code(self, short: bool) -> Code {
        use SuccessorCondition::*;
        match (self, short) {
            (Always, true) => Code::Jmp_rel8_32,
            (Always, false) => Code::Jmp_rel32_32,
            (Overflow, true) => Code::Jo_rel8_32,
            (Overflow, false) => Code::Jo_rel32_32,
            (NotOverflow, true) => Code::Jno_rel8_32,
            (NotOverflow, false) => Code::Jno_rel32_32,
            (Below, true) => Code::Jb_rel8_32,
            (Below, false) => Code::Jb_rel32_32,
            (AboveOrEqual, true) => Code::Jae_rel8_32,
            (AboveOrEqual, false) => Code::Jae_rel32_32,
            (Equal, true) => Code::Je_rel8_32,
            (Equal, false) => Code::Je_rel32_32,
            (NotEqual, true) => Code::Jne_rel8_32,
            (NotEqual, false) => Code::Jne_rel32_32,
            (BelowOrEqual, true) => Code::Jbe_rel8_32,
            (BelowOrEqual, false) => Code::Jbe_rel32_32,
            (Above, true) => Code::Ja_rel8_32,
            (Above, false) => Code::Ja_rel32_32,
            (Sign, true) => Code::Js_rel8_32,
            (Sign, false) => Code::Js_rel32_32,
            (NotSign, true) => Code::Jns_rel8_32,
            (NotSign, false) => Code::Jns_rel32_32,
            (Parity, true) => Code::Jp_rel8_32,
            (Parity, false) => Code::Jp_rel32_32,
            (NotParity, true) => Code::Jnp_rel8_32,
            (NotParity, false) => Code::Jnp_rel32_32,
            (Less, true) => Code::Jl_rel8_32,
            (Less, false) => Code::Jl_rel32_32,
            (GreaterOrEqual, true) => Code::Jge_rel8_32,
            (GreaterOrEqual, false) => Code::Jge_rel32_32,
            (LessOrEqual, true) => Code::Jle_rel8_32,
            (LessOrEqual, false) => Code::Jle_rel32_32,
            (Greater, true) => Code::Jg_rel8_32,
            (Greater, false) => Code::Jg_rel32_32,
        }
    }

    /// The encoded length of the branch realizing this condition.
    ///
    /// Short forms are always 2 bytes. Long `jmp` is 5 bytes, long `jcc` 6 bytes.
    #[must_use]
    pub fn branch_len(self, short: bool) -> u32 {
        match (self, short) {
            (_, true) => 2,
            (SuccessorCondition::Always, false) => 5,
            (_, false) => 6,
        }
    }

    /// The offset of the displacement slot inside the encoded branch.
    #[must_use]
    pub fn displacement_offset(self, short: bool) -> u32 {
        match (self, short) {
            (_, true) => 1,
            (SuccessorCondition::Always, false) => 1,
            (_, false) => 2,
        }
    }
}

impl fmt::Display for SuccessorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SuccessorCondition::*;
        let name = match self {
            Always => "jmp",
            Overflow => "jo",
            NotOverflow => "jno",
            Below => "jb",
            AboveOrEqual => "jae",
            Equal => "je",
            NotEqual => "jne",
            BelowOrEqual => "jbe",
            Above => "ja",
            Sign => "js",
            NotSign => "jns",
            Parity => "jp",
            NotParity => "jnp",
            Less => "jl",
            GreaterOrEqual => "jge",
            LessOrEqual => "jle",
            Greater => "jg",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CONDITIONAL: [SuccessorCondition; 16] = [
        SuccessorCondition::Overflow,
        SuccessorCondition::NotOverflow,
        SuccessorCondition::Below,
        SuccessorCondition::AboveOrEqual,
        SuccessorCondition::Equal,
        SuccessorCondition::NotEqual,
        SuccessorCondition::BelowOrEqual,
        SuccessorCondition::Above,
        SuccessorCondition::Sign,
        SuccessorCondition::NotSign,
        SuccessorCondition::Parity,
        SuccessorCondition::NotParity,
        SuccessorCondition::Less,
        SuccessorCondition::GreaterOrEqual,
        SuccessorCondition::LessOrEqual,
        SuccessorCondition::Greater,
    ];

    #[test]
    fn inverse_is_an_involution() {
        for condition in ALL_CONDITIONAL {
            let inverse = condition.inverse().unwrap();
            assert_ne!(condition, inverse);
            assert_eq!(inverse.inverse(), Some(condition));
        }
        assert_eq!(SuccessorCondition::Always.inverse(), None);
    }

    #[test]
    fn branch_lengths() {
        assert_eq!(SuccessorCondition::Always.branch_len(true), 2);
        assert_eq!(SuccessorCondition::Always.branch_len(false), 5);
        assert_eq!(SuccessorCondition::Equal.branch_len(true), 2);
        assert_eq!(SuccessorCondition::Equal.branch_len(false), 6);
    }

    #[test]
    fn condition_code_round_trip() {
        assert_eq!(
            SuccessorCondition::from_condition_code(ConditionCode::e),
            Some(SuccessorCondition::Equal)
        );
        assert_eq!(
            SuccessorCondition::from_condition_code(ConditionCode::None),
            None
        );
    }
}
