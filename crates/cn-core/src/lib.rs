pub mod command;
pub mod config;
pub mod plan_validator;
pub mod types;

pub use command::{validate_command, validate_command_str, FieldViolation, SchemaViolation};
pub use plan_validator::{
    validate_plan, PlanValidationError, PlanValidator, ValidationOptions, ViolationKind,
};
