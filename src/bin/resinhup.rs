// executable wrapper for resinhup

use std::process::exit;

use resinhup::{upgrade, UpdErrorKind};

fn main() {
    if let Err(error) = upgrade() {
        match error.kind() {
            UpdErrorKind::Displayed => {
                println!("resinhup failed with an error, see messages above");
            }
            _ => {
                println!("resinhup failed with an error: {}", error);
            }
        }
        exit(1);
    }
    exit(0);
}
