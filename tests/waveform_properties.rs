//! Property tests for the waveform codec

use proptest::prelude::*;
use rust_fgen::waveform::{encode, Waveform, MIN_POINTS};

fn samples() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-1.0e3f64..1.0e3, MIN_POINTS..512)
}

proptest! {
    #[test]
    fn decode_is_within_one_quantum(samples in samples()) {
        let encoded = encode(&samples);
        let quantum = encoded.quantum();
        for (orig, back) in samples.iter().zip(encoded.decode()) {
            // One code step plus float slack
            prop_assert!((orig - back).abs() <= quantum * (1.0 + 1e-9) + 1e-12);
        }
    }

    #[test]
    fn extremes_reach_full_scale(samples in samples()) {
        let encoded = encode(&samples);
        prop_assume!(encoded.scale > 0.0);
        prop_assert_eq!(encoded.codes.iter().copied().max(), Some(32767));
        prop_assert_eq!(encoded.codes.iter().copied().min(), Some(-32767));
    }

    #[test]
    fn flat_waveform_is_all_zero(value in -1.0e3f64..1.0e3, len in MIN_POINTS..256usize) {
        let encoded = encode(&vec![value; len]);
        prop_assert!(encoded.codes.iter().all(|&c| c == 0));
    }

    #[test]
    fn wire_text_has_one_field_per_sample(samples in samples()) {
        let wire = encode(&samples).to_wire();
        prop_assert!(!wire.ends_with(','));
        prop_assert_eq!(wire.split(',').count(), samples.len());
        for field in wire.split(',') {
            prop_assert!(field.parse::<i16>().is_ok());
        }
    }

    #[test]
    fn valid_waveforms_construct(samples in samples(), rate in 1.0f64..1.0e8) {
        let waveform = Waveform::new("stim", samples.clone(), rate);
        prop_assert!(waveform.is_ok());
    }
}
