mod transform_roundtrip;
