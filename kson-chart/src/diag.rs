//! Typed warnings collected by the loaders and the KSH writer.
//!
//! Warnings never halt processing; callers surface them selectively. A
//! "player" warning affects gameplay, an "editor" warning is informational.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningScope {
    Player,
    Editor,
    Both,
}

impl WarningScope {
    pub fn affects_player(&self) -> bool {
        matches!(self, WarningScope::Player | WarningScope::Both)
    }

    pub fn affects_editor(&self) -> bool {
        matches!(self, WarningScope::Editor | WarningScope::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KshLoadingWarningKind {
    TitleNotAtBeginning,
    MissingTimeSigAtZero,
    AudioEffectMissingType,
    AudioEffectInvalidType,
    UncommittedBtNote,
    UncommittedFxNote,
    UndefinedAudioEffect,
    Sub32ndSlamLasers,
    MeasureSplitNotDivisible,
    UnexpectedError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KshLoadingWarning {
    pub kind: KshLoadingWarningKind,
    pub scope: WarningScope,
    pub message: String,
    /// 1-based source line, or 0 when no line applies.
    pub line_no: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KshLoadingDiag {
    pub warnings: Vec<KshLoadingWarning>,
}

impl KshLoadingDiag {
    pub fn push(
        &mut self,
        kind: KshLoadingWarningKind,
        scope: WarningScope,
        message: impl Into<String>,
        line_no: i64,
    ) {
        self.warnings.push(KshLoadingWarning {
            kind,
            scope,
            message: message.into(),
            line_no,
        });
    }

    pub fn player_warnings(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.scope.affects_player())
            .map(|w| w.message.clone())
            .collect()
    }

    pub fn editor_warnings(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.scope.affects_editor())
            .map(|w| w.message.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KshSavingWarning {
    pub scope: WarningScope,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KshSavingDiag {
    pub warnings: Vec<KshSavingWarning>,
}

impl KshSavingDiag {
    pub fn push(&mut self, scope: WarningScope, message: impl Into<String>) {
        self.warnings.push(KshSavingWarning {
            scope,
            message: message.into(),
        });
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.message.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KsonLoadingWarningKind {
    InvalidGraphValueFormat,
    InvalidByPulseEntryFormat,
    InvalidGraphEntryFormat,
    InvalidByMeasureIdxEntryFormat,
    InvalidNoteEntryFormat,
    InvalidLaserSectionFormat,
    MissingFormatVersion,
    InvalidFormatVersion,
    NewerFormatVersion,
    JsonParseError,
    JsonTypeError,
    UnexpectedError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KsonLoadingWarning {
    pub kind: KsonLoadingWarningKind,
    pub scope: WarningScope,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KsonLoadingDiag {
    pub warnings: Vec<KsonLoadingWarning>,
}

impl KsonLoadingDiag {
    pub fn push(
        &mut self,
        kind: KsonLoadingWarningKind,
        scope: WarningScope,
        message: impl Into<String>,
    ) {
        self.warnings.push(KsonLoadingWarning {
            kind,
            scope,
            message: message.into(),
        });
    }

    pub fn player_warnings(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.scope.affects_player())
            .map(|w| w.message.clone())
            .collect()
    }

    pub fn editor_warnings(&self) -> Vec<String> {
        self.warnings
            .iter()
            .filter(|w| w.scope.affects_editor())
            .map(|w| w.message.clone())
            .collect()
    }
}
