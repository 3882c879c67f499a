pub mod consult_experts;
pub mod execute_script;
pub mod script_files;
