//! Operation tables: the immutable per-module map from operation code to
//! operation metadata that both invokers and performers dispatch on.

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;

use crate::codec::decode_payload;
use crate::operation::RemoteOperation;
use crate::types::{ErrorCode, OperationCode};

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Metadata for one operation of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub code: OperationCode,
    pub name: &'static str,
    /// Rust type name of the argument, used to detect mismatched markers.
    pub argument_type: &'static str,
    /// Rust type name of the result.
    pub result_type: &'static str,
    /// Error codes this operation may return.
    pub errors: &'static [ErrorCode],
}

impl OperationDescriptor {
    /// Whether `code` is among the errors this operation declares.
    #[must_use]
    pub fn declares_error(&self, code: ErrorCode) -> bool {
        self.errors.contains(&code)
    }
}

/// Parameter type of an error, with a check that encoded bytes decode as it.
#[derive(Clone, Copy)]
pub struct ParameterType {
    pub name: &'static str,
    decodes: fn(&[u8]) -> bool,
}

impl ParameterType {
    fn of<T: DeserializeOwned>() -> Self {
        fn decodes<T: DeserializeOwned>(bytes: &[u8]) -> bool {
            decode_payload::<T>(bytes).is_ok()
        }
        Self {
            name: std::any::type_name::<T>(),
            decodes: decodes::<T>,
        }
    }

    #[must_use]
    pub fn decodes(&self, bytes: &[u8]) -> bool {
        (self.decodes)(bytes)
    }
}

impl std::fmt::Debug for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

impl PartialEq for ParameterType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ParameterType {}

/// Metadata for one application error of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescriptor {
    pub code: ErrorCode,
    pub name: &'static str,
    /// Parameter the error carries, if any.
    pub parameter_type: Option<ParameterType>,
}

impl ErrorDescriptor {
    #[must_use]
    pub fn new(code: ErrorCode, name: &'static str) -> Self {
        Self {
            code,
            name,
            parameter_type: None,
        }
    }

    #[must_use]
    pub fn with_parameter<T: DeserializeOwned>(mut self) -> Self {
        self.parameter_type = Some(ParameterType::of::<T>());
        self
    }

    /// Whether `parameter` fits this error. The parameter may be left out;
    /// when present it must decode as the declared type, and an error that
    /// declares none accepts none.
    #[must_use]
    pub fn accepts_parameter(&self, parameter: Option<&[u8]>) -> bool {
        match (self.parameter_type, parameter) {
            (_, None) => true,
            (Some(ty), Some(bytes)) => ty.decodes(bytes),
            (None, Some(_)) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TableError
// ---------------------------------------------------------------------------

/// Configuration errors detected while building or consulting a table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("operation code {code} used by both {first} and {second}")]
    DuplicateCode {
        code: OperationCode,
        first: &'static str,
        second: &'static str,
    },
    #[error("operation name {name} declared twice")]
    DuplicateName { name: &'static str },
    #[error("error code {code} declared twice")]
    DuplicateError { code: ErrorCode },
    #[error("operation {operation} references undeclared error {code}")]
    UndeclaredError {
        operation: &'static str,
        code: ErrorCode,
    },
    #[error("operation code {code} is not in table {module}")]
    UnknownOperation {
        module: &'static str,
        code: OperationCode,
    },
    #[error("operation {code} does not match table entry: expected {expected}, found {found}")]
    TypeMismatch {
        code: OperationCode,
        expected: String,
        found: String,
    },
}

// ---------------------------------------------------------------------------
// OperationTable
// ---------------------------------------------------------------------------

/// Immutable mapping from operation code to descriptor for one module.
///
/// Codes and names are unique; every error an operation references is
/// declared in the table. Built once through [`TableBuilder`].
#[derive(Debug, Clone)]
pub struct OperationTable {
    module: &'static str,
    operations: BTreeMap<OperationCode, OperationDescriptor>,
    by_name: HashMap<&'static str, OperationCode>,
    errors: BTreeMap<ErrorCode, ErrorDescriptor>,
}

impl OperationTable {
    /// Starts building a table for the named module.
    #[must_use]
    pub fn builder(module: &'static str) -> TableBuilder {
        TableBuilder {
            module,
            operations: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn module(&self) -> &'static str {
        self.module
    }

    #[must_use]
    pub fn get(&self, code: OperationCode) -> Option<&OperationDescriptor> {
        self.operations.get(&code)
    }

    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&OperationDescriptor> {
        self.by_name.get(name).and_then(|code| self.operations.get(code))
    }

    #[must_use]
    pub fn error(&self, code: ErrorCode) -> Option<&ErrorDescriptor> {
        self.errors.get(&code)
    }

    /// Operations in ascending code order.
    pub fn operations(&self) -> impl Iterator<Item = &OperationDescriptor> {
        self.operations.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Looks up a descriptor, failing with a configuration error when absent.
    ///
    /// # Errors
    ///
    /// Returns `TableError::UnknownOperation` if `code` is not in the table.
    pub fn require(&self, code: OperationCode) -> Result<&OperationDescriptor, TableError> {
        self.get(code).ok_or(TableError::UnknownOperation {
            module: self.module,
            code,
        })
    }

    /// Checks that the typed marker `Op` matches this table's entry.
    ///
    /// # Errors
    ///
    /// Returns `TableError::UnknownOperation` if `Op::CODE` is absent, or
    /// `TableError::TypeMismatch` if name, argument, or result type differ.
    pub fn verify<Op: RemoteOperation>(&self) -> Result<&OperationDescriptor, TableError> {
        let entry = self.require(Op::CODE)?;
        let marker = Op::descriptor();
        if entry.name != marker.name
            || entry.argument_type != marker.argument_type
            || entry.result_type != marker.result_type
        {
            return Err(TableError::TypeMismatch {
                code: Op::CODE,
                expected: format!(
                    "{}({}) -> {}",
                    entry.name, entry.argument_type, entry.result_type
                ),
                found: format!(
                    "{}({}) -> {}",
                    marker.name, marker.argument_type, marker.result_type
                ),
            });
        }
        Ok(entry)
    }
}

// ---------------------------------------------------------------------------
// TableBuilder
// ---------------------------------------------------------------------------

/// Collects descriptors and validates them into an [`OperationTable`].
#[derive(Debug)]
pub struct TableBuilder {
    module: &'static str,
    operations: Vec<OperationDescriptor>,
    errors: Vec<ErrorDescriptor>,
}

impl TableBuilder {
    /// Adds the operation described by a typed marker.
    #[must_use]
    pub fn operation<Op: RemoteOperation>(self) -> Self {
        self.descriptor(Op::descriptor())
    }

    /// Adds an operation from an explicit descriptor.
    #[must_use]
    pub fn descriptor(mut self, descriptor: OperationDescriptor) -> Self {
        self.operations.push(descriptor);
        self
    }

    #[must_use]
    pub fn error(mut self, error: ErrorDescriptor) -> Self {
        self.errors.push(error);
        self
    }

    /// Validates uniqueness and error references, then freezes the table.
    ///
    /// # Errors
    ///
    /// Returns the first `TableError` found: a duplicate operation code or
    /// name, a duplicate error code, or an operation referencing an error
    /// the table does not declare.
    pub fn build(self) -> Result<OperationTable, TableError> {
        let mut errors = BTreeMap::new();
        for error in self.errors {
            let code = error.code;
            if errors.insert(code, error).is_some() {
                return Err(TableError::DuplicateError { code });
            }
        }

        let mut operations: BTreeMap<OperationCode, OperationDescriptor> = BTreeMap::new();
        let mut by_name = HashMap::new();
        for op in self.operations {
            if let Some(existing) = operations.get(&op.code) {
                return Err(TableError::DuplicateCode {
                    code: op.code,
                    first: existing.name,
                    second: op.name,
                });
            }
            if by_name.insert(op.name, op.code).is_some() {
                return Err(TableError::DuplicateName { name: op.name });
            }
            if let Some(code) = op.errors.iter().find(|code| !errors.contains_key(*code)) {
                return Err(TableError::UndeclaredError {
                    operation: op.name,
                    code: *code,
                });
            }
            operations.insert(op.code, op);
        }

        tracing::debug!(
            module = self.module,
            operations = operations.len(),
            errors = errors.len(),
            "operation table built"
        );

        Ok(OperationTable {
            module: self.module,
            operations,
            by_name,
            errors,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
