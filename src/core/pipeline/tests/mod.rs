mod end_to_end;
mod executor;
mod planning;
mod support;
